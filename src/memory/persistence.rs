//! 对话持久化
//!
//! `ConversationStore` 按对话 id 读写对话与计划；`JsonFileStore` 每个对话两个 JSON 文件，
//! 先写临时文件再 rename。`DebouncedSaver` 为每个对话维护一个可取消重排的延迟保存，
//! 同一对话任意时刻至多一个保存在执行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::core::PersistenceError;
use crate::plan::PhasePlan;

/// 持久化协作方；save 必须幂等，可被合并
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load_conversation(&self, id: &str) -> Result<Conversation, PersistenceError>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), PersistenceError>;

    async fn load_plan(&self, conversation_id: &str) -> Result<Option<PhasePlan>, PersistenceError>;

    async fn save_plan(&self, conversation_id: &str, plan: &PhasePlan) -> Result<(), PersistenceError>;

    async fn list_conversation_ids(&self) -> Result<Vec<String>, PersistenceError>;
}

/// 保存对话及其计划（若有）
pub async fn save_snapshot(
    store: &dyn ConversationStore,
    conversation: &Conversation,
) -> Result<(), PersistenceError> {
    store.save_conversation(conversation).await?;
    if let Some(plan) = &conversation.plan {
        store.save_plan(&conversation.id, plan).await?;
    }
    Ok(())
}

const CONVERSATION_SUFFIX: &str = ".conversation.json";
const PLAN_SUFFIX: &str = ".plan.json";

/// 目录下的 JSON 文件存储
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// id 只保留字母数字与 `-` `_`，防止路径穿越
    fn sanitize(id: &str) -> String {
        id.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", Self::sanitize(id), CONVERSATION_SUFFIX))
    }

    fn plan_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", Self::sanitize(id), PLAN_SUFFIX))
    }

    async fn write_atomic(&self, path: &Path, data: String) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn load_conversation(&self, id: &str) -> Result<Conversation, PersistenceError> {
        let path = self.conversation_path(id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), PersistenceError> {
        let data = serde_json::to_string_pretty(conversation)?;
        self.write_atomic(&self.conversation_path(&conversation.id), data).await?;
        tracing::debug!(conversation_id = %conversation.id, "conversation saved");
        Ok(())
    }

    async fn load_plan(&self, conversation_id: &str) -> Result<Option<PhasePlan>, PersistenceError> {
        match tokio::fs::read_to_string(self.plan_path(conversation_id)).await {
            Ok(data) => Ok(Some(crate::plan::from_json(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_plan(&self, conversation_id: &str, plan: &PhasePlan) -> Result<(), PersistenceError> {
        let data = crate::plan::to_json(plan)?;
        self.write_atomic(&self.plan_path(conversation_id), data).await
    }

    async fn list_conversation_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(CONVERSATION_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// 进程内存储（测试与不落盘运行）
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    plans: Mutex<HashMap<String, PhasePlan>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// save_conversation 被调用的次数
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load_conversation(&self, id: &str) -> Result<Conversation, PersistenceError> {
        self.conversations
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), PersistenceError> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut stored = conversation.clone();
        stored.plan = None;
        self.conversations.lock().await.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn load_plan(&self, conversation_id: &str) -> Result<Option<PhasePlan>, PersistenceError> {
        Ok(self.plans.lock().await.get(conversation_id).cloned())
    }

    async fn save_plan(&self, conversation_id: &str, plan: &PhasePlan) -> Result<(), PersistenceError> {
        self.plans
            .lock()
            .await
            .insert(conversation_id.to_string(), plan.clone());
        Ok(())
    }

    async fn list_conversation_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids: Vec<String> = self.conversations.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

struct PendingSave {
    generation: u64,
    snapshot: Conversation,
    timer: CancellationToken,
}

/// 每个键的写槽：互斥写入，记录已落盘的最大代数
type WriteSlot = Arc<Mutex<u64>>;

#[derive(Default)]
struct SaverState {
    pending: Mutex<HashMap<String, PendingSave>>,
    /// 只在有写入进行或排队时存在；锁顺序固定为 pending → in_flight
    in_flight: Mutex<HashMap<String, WriteSlot>>,
    generation: std::sync::atomic::AtomicU64,
}

/// 按对话去抖的保存调度器
///
/// 计时器和 flush 可能交错执行；写入前在键锁下比较代数，旧快照不会覆盖新快照。
#[derive(Clone)]
pub struct DebouncedSaver {
    store: Arc<dyn ConversationStore>,
    delay: Duration,
    state: Arc<SaverState>,
}

impl DebouncedSaver {
    pub fn new(store: Arc<dyn ConversationStore>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            state: Arc::new(SaverState::default()),
        }
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    /// 取消该对话尚未触发的保存，以最新快照重新计时
    pub async fn schedule(&self, conversation: &Conversation) {
        let id = conversation.id.clone();
        let generation = self
            .state
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let timer = CancellationToken::new();
        {
            let mut pending = self.state.pending.lock().await;
            if let Some(previous) = pending.insert(
                id.clone(),
                PendingSave {
                    generation,
                    snapshot: conversation.clone(),
                    timer: timer.clone(),
                },
            ) {
                previous.timer.cancel();
            }
        }

        let saver = self.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some((entry, slot)) = saver.take_pending(&id, Some(generation)).await {
                if let Err(e) = saver.write(entry, slot).await {
                    tracing::error!(conversation_id = %id, error = %e, "debounced save failed");
                }
            }
        });
    }

    /// 取出待保存项并占住该键的写槽；`generation` 给定时只取该代
    async fn take_pending(&self, id: &str, generation: Option<u64>) -> Option<(PendingSave, WriteSlot)> {
        let mut pending = self.state.pending.lock().await;
        let current = pending.get(id)?.generation;
        if generation.is_some_and(|g| g != current) {
            return None;
        }
        let entry = pending.remove(id)?;
        let slot = self
            .state
            .in_flight
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone();
        Some((entry, slot))
    }

    async fn write(&self, entry: PendingSave, slot: WriteSlot) -> Result<(), PersistenceError> {
        entry.timer.cancel();
        let id = entry.snapshot.id.clone();
        let result = {
            let mut written = slot.lock().await;
            if *written >= entry.generation {
                tracing::debug!(
                    conversation_id = %id,
                    generation = entry.generation,
                    written = *written,
                    "newer snapshot already saved, skipping"
                );
                Ok(())
            } else {
                let result = save_snapshot(self.store.as_ref(), &entry.snapshot).await;
                if result.is_ok() {
                    *written = entry.generation;
                }
                result
            }
        };
        drop(slot);
        self.release(&id).await;
        result
    }

    /// 没有待保存项、也没有其他写入持有写槽时回收它
    async fn release(&self, id: &str) {
        let pending = self.state.pending.lock().await;
        let mut in_flight = self.state.in_flight.lock().await;
        let idle = !pending.contains_key(id) && in_flight.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            in_flight.remove(id);
        }
    }

    /// 立即保存该对话的待保存快照；没有待保存项时不做任何事
    pub async fn flush(&self, id: &str) -> Result<(), PersistenceError> {
        match self.take_pending(id, None).await {
            Some((entry, slot)) => self.write(entry, slot).await,
            None => Ok(()),
        }
    }

    pub async fn flush_all(&self) -> Result<(), PersistenceError> {
        let ids: Vec<String> = self.state.pending.lock().await.keys().cloned().collect();
        for id in ids {
            self.flush(&id).await?;
        }
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::plan::types::fixtures::{phase, task};

    fn sample() -> Conversation {
        let mut c = Conversation::new("Todo app");
        c.messages.push(Message::user("Build a todo app"));
        c.messages.push(Message::assistant("Which platform?"));
        c.set_plan(PhasePlan::new(
            "Todo",
            "Todo app",
            vec![phase("phase-001", 1, &[], vec![task("t1")])],
        ));
        c
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let c = sample();
        save_snapshot(&store, &c).await.unwrap();

        let loaded = store.load_conversation(&c.id).await.unwrap();
        assert_eq!(loaded.messages, c.messages);
        assert_eq!(loaded.state, c.state);
        assert_eq!(store.load_plan(&c.id).await.unwrap(), c.plan);
        assert_eq!(store.list_conversation_ids().await.unwrap(), vec![c.id.clone()]);
    }

    #[tokio::test]
    async fn test_json_store_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent"));
        assert!(matches!(
            store.load_conversation("nope").await,
            Err(PersistenceError::NotFound(_))
        ));
        assert!(store.load_plan("nope").await.unwrap().is_none());
        assert!(store.list_conversation_ids().await.unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_blocks_traversal() {
        let store = JsonFileStore::new("/data");
        let path = store.conversation_path("../../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/data")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces() {
        let store = Arc::new(InMemoryStore::new());
        let saver = DebouncedSaver::new(store.clone(), Duration::from_millis(500));
        let mut c = sample();
        for i in 0..5 {
            c.title = format!("v{}", i);
            saver.schedule(&c).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_conversation(&c.id).await.unwrap().title, "v4");
        assert!(store.load_plan(&c.id).await.unwrap().is_some());
        assert_eq!(saver.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys() {
        let store = Arc::new(InMemoryStore::new());
        let saver = DebouncedSaver::new(store.clone(), Duration::from_millis(200));
        let a = sample();
        let b = sample();
        saver.schedule(&a).await;
        saver.schedule(&b).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_saves_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let saver = DebouncedSaver::new(store.clone(), Duration::from_secs(60));
        let c = sample();
        saver.schedule(&c).await;
        saver.flush(&c.id).await.unwrap();
        assert_eq!(store.save_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.save_count(), 1);

        saver.flush(&c.id).await.unwrap();
        saver.flush_all().await.unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_older_snapshot_never_overwrites_newer() {
        let store = Arc::new(InMemoryStore::new());
        let saver = DebouncedSaver::new(store.clone(), Duration::from_secs(60));
        let mut c = sample();
        c.title = "old".into();
        saver.schedule(&c).await;
        // 计时器已取出旧快照但还没写
        let (stale, slot) = saver.take_pending(&c.id, None).await.unwrap();

        c.title = "new".into();
        saver.schedule(&c).await;
        saver.flush(&c.id).await.unwrap();
        saver.write(stale, slot).await.unwrap();

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_conversation(&c.id).await.unwrap().title, "new");
        assert!(saver.state.in_flight.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_slots_are_released() {
        let store = Arc::new(InMemoryStore::new());
        let saver = DebouncedSaver::new(store.clone(), Duration::from_millis(100));
        for _ in 0..20 {
            saver.schedule(&sample()).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count(), 20);
        assert!(saver.state.in_flight.lock().await.is_empty());

        let c = sample();
        saver.schedule(&c).await;
        saver.flush_all().await.unwrap();
        assert_eq!(saver.pending_count().await, 0);
        assert!(saver.state.in_flight.lock().await.is_empty());
    }
}
