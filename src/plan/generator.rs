//! 阶段计划生成器
//!
//! 由需求文本计算阶段数范围 → 渲染严格 JSON 提示 → 分发请求 → 解析与校验。
//! 第一次结果不可用时带着错误原因做一次纠正重试；第二次仍失败则返回 InvalidPlan，不会降级为部分计划。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::PlanError;
use crate::llm::{ChatRequest, ProviderRegistry};
use crate::memory::Message;
use crate::plan::complexity::{detect_technologies, phase_range};
use crate::plan::parser::{parse_json, RawPlan};
use crate::plan::types::{PhasePlan, PhaseRange, PlanComplexity};
use crate::plan::validator::validate_and_normalize;
use crate::prompts::defaults::{PHASE_GENERATION, PLAN_CORRECTION};
use crate::prompts::PromptEngine;

/// 解析并校验一次 LLM 输出；失败原因用于纠正提示
pub fn parse_plan(output: &str, range: PhaseRange) -> Result<PhasePlan, String> {
    let raw: RawPlan = parse_json(output)?;
    validate_and_normalize(&raw, range).map_err(|errors| errors.join("; "))
}

pub struct PhasePlanGenerator {
    registry: Arc<ProviderRegistry>,
    prompts: Arc<PromptEngine>,
    temperature: Option<f32>,
}

impl PhasePlanGenerator {
    pub fn new(registry: Arc<ProviderRegistry>, prompts: Arc<PromptEngine>) -> Self {
        Self {
            registry,
            prompts,
            temperature: Some(0.2),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn request(&self, messages: Vec<Message>, cancel: &Option<CancellationToken>) -> ChatRequest {
        let mut req = ChatRequest::new(messages);
        req.temperature = self.temperature;
        req.cancel = cancel.clone();
        req
    }

    /// 生成并校验计划
    pub async fn generate(
        &self,
        requirements: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<PhasePlan, PlanError> {
        let requirements = requirements.trim();
        if requirements.is_empty() {
            return Err(PlanError::NoRequirements);
        }

        let range = phase_range(requirements);
        let min = range.min.to_string();
        let max = range.max.to_string();
        tracing::info!(min_phases = range.min, max_phases = range.max, "generating phase plan");

        let system = self.prompts.system_message(
            PHASE_GENERATION,
            &[
                ("requirements", requirements),
                ("min_phases", min.as_str()),
                ("max_phases", max.as_str()),
            ],
        )?;
        let mut messages = vec![system, Message::user("Generate the phase plan now.")];

        let first = self
            .registry
            .send_message(&self.request(messages.clone(), &cancel))
            .await?;

        let (mut plan, provider) = match parse_plan(&first.content, range) {
            Ok(plan) => (plan, first.provider),
            Err(reason) => {
                tracing::warn!(reason = %reason, "plan rejected, retrying with corrective instruction");
                let correction = self.prompts.render(
                    PLAN_CORRECTION,
                    &[("error", reason.as_str()), ("min_phases", min.as_str()), ("max_phases", max.as_str())],
                )?;
                messages.push(Message::assistant(first.content));
                messages.push(Message::user(correction));

                let second = self
                    .registry
                    .send_message(&self.request(messages, &cancel))
                    .await?;
                match parse_plan(&second.content, range) {
                    Ok(plan) => (plan, second.provider),
                    Err(reason) => {
                        tracing::error!(reason = %reason, "plan rejected after corrective retry");
                        return Err(PlanError::InvalidPlan(reason));
                    }
                }
            }
        };

        finalize_metadata(&mut plan, requirements, Some(provider));
        tracing::info!(
            phases = plan.total_phases,
            hours = plan.metadata.estimated_hours,
            "phase plan generated"
        );
        Ok(plan)
    }
}

/// 计划级元数据：加权工时、复杂度分档、检测到的技术
pub fn finalize_metadata(plan: &mut PhasePlan, requirements: &str, provider: Option<String>) {
    plan.sync_total_phases();
    plan.metadata.estimated_hours = plan.phases.iter().map(|p| p.complexity.weight_hours()).sum();
    plan.metadata.complexity = PlanComplexity::from_phase_count(plan.total_phases);
    plan.metadata.technologies = detect_technologies(requirements);
    plan.metadata.generated_by = provider;
}
