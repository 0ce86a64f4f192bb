//! 循环计数与激励：迭代上限、连击倍率、成就
//!
//! 倍率以十分之一为单位存整数：每次成功加上当前连胜数（1.1、1.3、1.6、2.0），封顶 2.0，
//! 任何失败回到 1.0。成就只增不减，重复解锁无效。

use crate::autonomous::types::Achievement;

const COMBO_BASE: u32 = 10;
const COMBO_MAX: u32 = 20;
const PERFECTIONIST_STREAK: usize = 5;
const MARATHON_TASKS: usize = 10;

pub struct LoopEngine {
    max_iterations: usize,
    iteration_count: usize,
    combo_tenths: u32,
    streak: usize,
    completed: usize,
    failed_last: bool,
    achievements: Vec<Achievement>,
}

impl LoopEngine {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            iteration_count: 0,
            combo_tenths: COMBO_BASE,
            streak: 0,
            completed: 0,
            failed_last: false,
            achievements: Vec::new(),
        }
    }

    pub fn can_continue(&self) -> bool {
        self.iteration_count < self.max_iterations
    }

    pub fn increment_iteration(&mut self) {
        self.iteration_count += 1;
    }

    pub fn current_iteration(&self) -> usize {
        self.iteration_count
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn combo_multiplier(&self) -> f64 {
        self.combo_tenths as f64 / 10.0
    }

    pub fn streak(&self) -> usize {
        self.streak
    }

    pub fn achievements(&self) -> Vec<String> {
        self.achievements.iter().map(|a| a.as_str().to_string()).collect()
    }

    fn unlock(&mut self, achievement: Achievement, unlocked: &mut Vec<Achievement>) {
        if !self.achievements.contains(&achievement) {
            self.achievements.push(achievement);
            unlocked.push(achievement);
        }
    }

    /// 记录一次任务成功，返回本次新解锁的成就
    pub fn record_success(&mut self, phase_completed: bool) -> Vec<Achievement> {
        self.streak += 1;
        self.completed += 1;
        self.combo_tenths = (self.combo_tenths + self.streak as u32).min(COMBO_MAX);

        let mut unlocked = Vec::new();
        self.unlock(Achievement::FirstTask, &mut unlocked);
        if phase_completed {
            self.unlock(Achievement::PhaseComplete, &mut unlocked);
        }
        if self.streak >= PERFECTIONIST_STREAK {
            self.unlock(Achievement::Perfectionist, &mut unlocked);
        }
        if self.failed_last {
            self.unlock(Achievement::Comeback, &mut unlocked);
        }
        if self.completed >= MARATHON_TASKS {
            self.unlock(Achievement::Marathon, &mut unlocked);
        }
        self.failed_last = false;
        unlocked
    }

    pub fn record_failure(&mut self) {
        self.streak = 0;
        self.combo_tenths = COMBO_BASE;
        self.failed_last = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combo_progression_and_cap() {
        let mut e = LoopEngine::new(10);
        let seen: Vec<f64> = (0..6)
            .map(|_| {
                e.record_success(false);
                e.combo_multiplier()
            })
            .collect();
        assert_eq!(seen, vec![1.1, 1.3, 1.6, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_failure_resets_combo() {
        let mut e = LoopEngine::new(10);
        e.record_success(false);
        e.record_success(false);
        e.record_failure();
        assert_eq!(e.combo_multiplier(), 1.0);
        assert_eq!(e.streak(), 0);
        let unlocked = e.record_success(false);
        assert_eq!(unlocked, vec![Achievement::Comeback]);
        assert_eq!(e.combo_multiplier(), 1.1);
    }

    #[test]
    fn test_perfectionist_once() {
        let mut e = LoopEngine::new(20);
        let mut unlocked = Vec::new();
        for _ in 0..8 {
            unlocked.extend(e.record_success(false));
        }
        assert_eq!(e.combo_multiplier(), 2.0);
        assert_eq!(
            unlocked.iter().filter(|a| **a == Achievement::Perfectionist).count(),
            1
        );
        assert_eq!(e.achievements(), vec!["first_task", "perfectionist"]);
    }

    #[test]
    fn test_marathon_and_phase_complete() {
        let mut e = LoopEngine::new(20);
        assert_eq!(
            e.record_success(true),
            vec![Achievement::FirstTask, Achievement::PhaseComplete]
        );
        for i in 0..9 {
            if i == 3 {
                e.record_failure();
            }
            e.record_success(false);
        }
        let names = e.achievements();
        assert!(names.contains(&"marathon".to_string()));
        assert!(names.contains(&"comeback".to_string()));
    }

    #[test]
    fn test_iteration_bound() {
        let mut e = LoopEngine::new(2);
        assert!(e.can_continue());
        e.increment_iteration();
        e.increment_iteration();
        assert!(!e.can_continue());
        assert_eq!(e.current_iteration(), 2);
    }
}
