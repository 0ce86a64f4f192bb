//! 对话管理器：驱动 IDLE → GATHERING_REQUIREMENTS → ANALYZING_REQUIREMENTS → GENERATING_PHASES → COMPLETE
//!
//! 每个对话一把异步锁，同一对话的轮次严格串行；不同对话互不阻塞。
//! 每次分发前先过上下文预算，每次迁移都会更新时间戳、发事件并排队保存。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::conversation::types::{default_title, Conversation, TurnOutcome};
use crate::core::events::{send_event, EngineEvent, EventSender};
use crate::core::{ConversationError, ConversationState, LlmError, PersistenceError, PlanError};
use crate::llm::{ChatRequest, ProviderRegistry};
use crate::memory::{
    summarize_messages, BudgetOutcome, ContextBudgetManager, ConversationStore, DebouncedSaver,
    Message, Role,
};
use crate::plan::{to_markdown, PhasePlan, PhasePlanGenerator};
use crate::prompts::defaults::{FOLLOW_UP, REQUIREMENTS_ANALYSIS, REQUIREMENTS_GATHERING};
use crate::prompts::PromptEngine;

/// 用户确认可以出计划的短语（小写子串匹配）
pub const READINESS_PHRASES: &[&str] = &[
    "ready for plan",
    "ready for the plan",
    "generate the plan",
    "generate plan",
    "create the plan",
    "make the plan",
    "that's all",
    "that is all",
    "go ahead",
    "let's start",
];

/// 用户消息累计字符数超过该值也视为需求已充分
pub const READINESS_CHAR_THRESHOLD: usize = 400;

pub const MIN_USER_TURNS: usize = 2;

/// 就绪判定：(确认短语 或 字符数超阈值) 且 至少两轮用户消息
pub fn is_ready_for_plan(conversation: &Conversation) -> bool {
    if conversation.user_turns() < MIN_USER_TURNS {
        return false;
    }
    let confirmed = conversation
        .user_messages()
        .last()
        .map(|m| {
            let lower = m.content.to_lowercase();
            READINESS_PHRASES.iter().any(|p| lower.contains(p))
        })
        .unwrap_or(false);
    confirmed || conversation.user_chars() > READINESS_CHAR_THRESHOLD
}

/// 计划概要，用于追问阶段的系统提示
fn plan_summary(plan: &PhasePlan) -> String {
    let mut out = format!("{}\n{}\n", plan.title, plan.description);
    for phase in &plan.phases {
        out.push_str(&format!("{}. {} ({})\n", phase.order, phase.title, phase.id));
    }
    out
}

fn is_cancellation(err: &ConversationError) -> bool {
    matches!(
        err,
        ConversationError::Llm(LlmError::Cancelled) | ConversationError::Plan(PlanError::Llm(LlmError::Cancelled))
    )
}

/// 插入或替换同一模板的系统提示，放在开头的系统提示区之后
fn upsert_system_prompt(conversation: &mut Conversation, prompt: Message) {
    let template_id = prompt.metadata.template_id.clone();
    if let Some(existing) = conversation
        .messages
        .iter_mut()
        .find(|m| m.is_system_prompt() && m.metadata.template_id == template_id)
    {
        existing.content = prompt.content;
        existing.metadata.token_count = None;
        return;
    }
    let at = conversation
        .messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    conversation.messages.insert(at, prompt);
}

/// 撤回失败的一轮：去掉本轮用户消息，IDLE 下连同刚插入的收集提示
///
/// 预算摘要可能已经压缩过更早的消息，所以只摘掉末尾，不按长度截断。
fn rollback_turn(conversation: &mut Conversation, state: ConversationState, title_was_empty: bool) {
    if conversation.messages.last().map(|m| m.role) == Some(Role::User) {
        conversation.messages.pop();
    }
    if state == ConversationState::Idle {
        conversation.messages.retain(|m| {
            !(m.is_system_prompt() && m.metadata.template_id.as_deref() == Some(REQUIREMENTS_GATHERING))
        });
    }
    if title_was_empty {
        conversation.title.clear();
    }
}

type Handle = Arc<Mutex<Conversation>>;

pub struct ConversationManager {
    registry: Arc<ProviderRegistry>,
    prompts: Arc<PromptEngine>,
    generator: Arc<PhasePlanGenerator>,
    context: ContextBudgetManager,
    saver: Option<DebouncedSaver>,
    events: Option<EventSender>,
    conversations: Mutex<HashMap<String, Handle>>,
}

impl ConversationManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        prompts: Arc<PromptEngine>,
        generator: Arc<PhasePlanGenerator>,
        context: ContextBudgetManager,
    ) -> Self {
        Self {
            registry,
            prompts,
            generator,
            context,
            saver: None,
            events: None,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_saver(mut self, saver: DebouncedSaver) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> Arc<ProviderRegistry> {
        self.registry.clone()
    }

    /// 新建对话，返回 id；标题为空时取首条用户消息
    pub async fn create_conversation(&self, title: Option<&str>) -> String {
        let conversation = Conversation::new(title.unwrap_or_default().trim());
        let id = conversation.id.clone();
        tracing::info!(conversation_id = %id, "conversation created");
        self.persist(&conversation).await;
        self.conversations
            .lock()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(conversation)));
        id
    }

    async fn handle(&self, id: &str) -> Result<Handle, ConversationError> {
        self.conversations
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))
    }

    pub async fn conversation(&self, id: &str) -> Result<Conversation, ConversationError> {
        Ok(self.handle(id).await?.lock().await.clone())
    }

    /// 所有对话快照，最近更新的在前
    pub async fn list_conversations(&self) -> Vec<Conversation> {
        let handles: Vec<Handle> = self.conversations.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(h.lock().await.clone());
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    pub async fn plan(&self, id: &str) -> Result<PhasePlan, ConversationError> {
        self.handle(id)
            .await?
            .lock()
            .await
            .plan
            .clone()
            .ok_or_else(|| ConversationError::NoPlan(id.to_string()))
    }

    /// 写回外部推进过的计划（如自主循环的执行进度）
    pub async fn store_plan(&self, id: &str, plan: PhasePlan) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conv = handle.lock().await;
        conv.set_plan(plan);
        conv.touch();
        self.persist(&conv).await;
        Ok(())
    }

    /// 从持久化层恢复对话（含计划）
    pub async fn load_conversation(&self, id: &str) -> Result<Conversation, ConversationError> {
        let store: Arc<dyn ConversationStore> = match &self.saver {
            Some(saver) => saver.store(),
            None => return Err(PersistenceError::NotFound(id.to_string()).into()),
        };
        let mut conversation = store.load_conversation(id).await?;
        conversation.plan = store.load_plan(id).await?;
        tracing::info!(conversation_id = %id, state = %conversation.state, "conversation loaded");
        self.conversations
            .lock()
            .await
            .insert(id.to_string(), Arc::new(Mutex::new(conversation.clone())));
        Ok(conversation)
    }

    /// 处理一轮用户输入
    pub async fn send_message(
        &self,
        id: &str,
        text: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<TurnOutcome, ConversationError> {
        let handle = self.handle(id).await?;
        let mut conv = handle.lock().await;

        if conv.state.is_terminal_error() {
            return Err(ConversationError::Errored);
        }
        // 上一轮规划在途中被丢弃时，状态会停在中间态
        if matches!(
            conv.state,
            ConversationState::AnalyzingRequirements | ConversationState::GeneratingPhases
        ) {
            tracing::warn!(conversation_id = %id, state = %conv.state, "recovering from interrupted planning");
            self.transition(
                &mut conv,
                ConversationState::GatheringRequirements,
                Some(json!({ "recovered": true })),
            )?;
            rollback_turn(&mut conv, ConversationState::GatheringRequirements, false);
        }

        // 先校验状态、渲染提示，全部通过后才改动历史
        let state = conv.state;
        let gathering_prompt = match state {
            ConversationState::Idle => Some(self.prompts.system_message(REQUIREMENTS_GATHERING, &[])?),
            ConversationState::GatheringRequirements | ConversationState::Complete => None,
            from => {
                return Err(ConversationError::InvalidTransition {
                    from: from.to_string(),
                    to: ConversationState::GatheringRequirements.to_string(),
                })
            }
        };

        let title_was_empty = conv.title.is_empty();
        if let Some(prompt) = gathering_prompt {
            upsert_system_prompt(&mut conv, prompt);
        }
        conv.messages.push(Message::user(text));
        if title_was_empty {
            conv.title = default_title(text);
        }
        tracing::debug!(conversation_id = %id, state = %state, "user turn");

        let result = match state {
            ConversationState::Idle => {
                self.chat_turn(&mut conv, ConversationState::GatheringRequirements, &cancel)
                    .await
            }
            ConversationState::GatheringRequirements if is_ready_for_plan(&conv) => {
                tracing::info!(conversation_id = %id, "requirements ready, planning");
                self.planning_turn(&mut conv, &cancel).await
            }
            _ => self.chat_turn(&mut conv, state, &cancel).await,
        };

        if result.is_err() && !conv.state.is_terminal_error() {
            rollback_turn(&mut conv, state, title_was_empty);
        }
        self.persist(&conv).await;
        result
    }

    /// 普通对话轮：失败时撤回本轮用户消息，状态不变
    async fn chat_turn(
        &self,
        conv: &mut Conversation,
        next: ConversationState,
        cancel: &Option<CancellationToken>,
    ) -> Result<TurnOutcome, ConversationError> {
        match self.dispatch(conv, cancel).await {
            Ok(reply) => {
                conv.messages.push(Message::assistant(reply.clone()));
                self.transition(conv, next, None)?;
                Ok(TurnOutcome {
                    reply,
                    state: conv.state,
                    plan_generated: false,
                })
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conv.id, error = %e, "chat turn failed");
                Err(e)
            }
        }
    }

    async fn planning_turn(
        &self,
        conv: &mut Conversation,
        cancel: &Option<CancellationToken>,
    ) -> Result<TurnOutcome, ConversationError> {
        self.transition(conv, ConversationState::AnalyzingRequirements, None)?;
        match self.analyze_and_generate(conv, cancel).await {
            Ok(plan) => {
                let reply = self.install_plan(conv, plan);
                let payload = json!({ "totalPhases": conv.phase_count });
                self.transition(conv, ConversationState::Complete, Some(payload))?;
                Ok(TurnOutcome {
                    reply,
                    state: conv.state,
                    plan_generated: true,
                })
            }
            Err(e) if is_cancellation(&e) => {
                // 取消不是失败：回到需求收集，可以重新确认
                tracing::info!(conversation_id = %conv.id, "planning cancelled");
                self.transition(
                    conv,
                    ConversationState::GatheringRequirements,
                    Some(json!({ "cancelled": true })),
                )?;
                Err(e)
            }
            Err(e) => {
                tracing::error!(conversation_id = %conv.id, error = %e, "planning failed");
                let payload = json!({ "error": e.to_string() });
                self.transition(conv, ConversationState::Error, Some(payload))?;
                Err(e)
            }
        }
    }

    async fn analyze_and_generate(
        &self,
        conv: &mut Conversation,
        cancel: &Option<CancellationToken>,
    ) -> Result<PhasePlan, ConversationError> {
        self.apply_budget(conv, cancel).await?;
        let transcript = conv.transcript();
        let prompt = self
            .prompts
            .render(REQUIREMENTS_ANALYSIS, &[("conversation", transcript.as_str())])?;
        let mut request = ChatRequest::new(vec![Message::user(prompt)]);
        request.cancel = cancel.clone();
        let analysis = self.registry.send_message(&request).await?;

        let requirements = if analysis.content.trim().is_empty() {
            conv.user_messages()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            analysis.content.trim().to_string()
        };
        conv.requirements_summary = Some(requirements.clone());

        self.transition(conv, ConversationState::GeneratingPhases, None)?;
        let mut plan = self.generator.generate(&requirements, cancel.clone()).await?;
        plan.conversation_id = Some(conv.id.clone());
        Ok(plan)
    }

    /// 存入计划、刷新追问提示、追加 Markdown 回复
    fn install_plan(&self, conv: &mut Conversation, plan: PhasePlan) -> String {
        let markdown = to_markdown(&plan);
        let summary = plan_summary(&plan);
        match self
            .prompts
            .system_message(FOLLOW_UP, &[("plan_summary", summary.as_str())])
        {
            Ok(prompt) => upsert_system_prompt(conv, prompt),
            Err(e) => tracing::warn!(error = %e, "follow-up prompt unavailable"),
        }
        send_event(
            &self.events,
            EngineEvent::PlanGenerated {
                conversation_id: conv.id.clone(),
                total_phases: plan.total_phases,
            },
        );
        conv.set_plan(plan);
        conv.messages.push(Message::assistant(markdown.clone()));
        markdown
    }

    /// 显式重新生成计划；状态保持 COMPLETE，失败时保留旧计划
    pub async fn regenerate_plan(
        &self,
        id: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<PhasePlan, ConversationError> {
        let handle = self.handle(id).await?;
        let mut conv = handle.lock().await;
        match conv.state {
            ConversationState::Complete => {}
            ConversationState::Error => return Err(ConversationError::Errored),
            from => {
                return Err(ConversationError::InvalidTransition {
                    from: from.to_string(),
                    to: ConversationState::Complete.to_string(),
                })
            }
        }

        let requirements = match &conv.requirements_summary {
            Some(summary) => summary.clone(),
            None => conv.transcript(),
        };
        tracing::info!(conversation_id = %id, "regenerating plan");
        let mut plan = self.generator.generate(&requirements, cancel).await?;
        plan.conversation_id = Some(conv.id.clone());
        self.install_plan(&mut conv, plan.clone());
        self.transition(
            &mut conv,
            ConversationState::Complete,
            Some(json!({ "regenerated": true, "totalPhases": plan.total_phases })),
        )?;
        self.persist(&conv).await;
        Ok(plan)
    }

    /// 外部重置：回到 IDLE，保留消息，清除计划与摘要
    pub async fn reset(&self, id: &str) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conv = handle.lock().await;
        let from = conv.state;
        conv.state = ConversationState::Idle;
        conv.plan = None;
        conv.phase_count = None;
        conv.requirements_summary = None;
        conv.context = Default::default();
        conv.touch();
        tracing::info!(conversation_id = %id, from = %from, "conversation reset");
        send_event(
            &self.events,
            EngineEvent::StateTransition {
                conversation_id: conv.id.clone(),
                from_state: from,
                to_state: ConversationState::Idle,
                timestamp: conv.updated_at,
                payload: Some(json!({ "reset": true })),
            },
        );
        self.persist(&conv).await;
        Ok(())
    }

    fn transition(
        &self,
        conv: &mut Conversation,
        to: ConversationState,
        payload: Option<serde_json::Value>,
    ) -> Result<(), ConversationError> {
        let from = conv.state;
        if !from.can_transition_to(to) {
            return Err(ConversationError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        conv.state = to;
        conv.touch();
        tracing::info!(conversation_id = %conv.id, from = %from, to = %to, "state transition");
        send_event(
            &self.events,
            EngineEvent::StateTransition {
                conversation_id: conv.id.clone(),
                from_state: from,
                to_state: to,
                timestamp: conv.updated_at,
                payload,
            },
        );
        Ok(())
    }

    /// 预算检查后把完整历史发给 Provider
    async fn dispatch(
        &self,
        conv: &mut Conversation,
        cancel: &Option<CancellationToken>,
    ) -> Result<String, ConversationError> {
        self.apply_budget(conv, cancel).await?;
        let mut request = ChatRequest::new(conv.messages.clone());
        request.cancel = cancel.clone();
        let response = self.registry.send_message(&request).await?;
        Ok(response.content)
    }

    async fn apply_budget(
        &self,
        conv: &mut Conversation,
        cancel: &Option<CancellationToken>,
    ) -> Result<(), ConversationError> {
        let max_tokens = self.registry.max_context_tokens();
        let registry = self.registry.clone();
        let prompts = self.prompts.clone();
        let cancel = cancel.clone();
        let summarize = move |older: Vec<Message>| summarize_messages(registry, prompts, older, cancel);

        let outcome = self
            .context
            .ensure_budget(&mut conv.messages, &mut conv.context, max_tokens, summarize)
            .await?;
        if let BudgetOutcome::Summarized {
            tokens_before,
            tokens_after,
        } = outcome
        {
            tracing::info!(
                conversation_id = %conv.id,
                tokens_before,
                tokens_after,
                "context summarized"
            );
            send_event(
                &self.events,
                EngineEvent::ContextSummarized {
                    conversation_id: conv.id.clone(),
                    tokens_before,
                    tokens_after,
                },
            );
        }
        Ok(())
    }

    async fn persist(&self, conv: &Conversation) {
        if let Some(saver) = &self.saver {
            saver.schedule(conv).await;
        }
    }

    /// 立即写出所有待保存的对话
    pub async fn flush(&self) -> Result<(), ConversationError> {
        if let Some(saver) = &self.saver {
            saver.flush_all().await?;
        }
        Ok(())
    }
}
