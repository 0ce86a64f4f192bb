//! 内置 Prompt 模板
//!
//! `{{name}}` 为变量占位；渲染时缺失任何变量都会报错。

pub const REQUIREMENTS_GATHERING: &str = "requirements_gathering";
pub const REQUIREMENTS_ANALYSIS: &str = "requirements_analysis";
pub const PHASE_GENERATION: &str = "phase_generation";
pub const PLAN_CORRECTION: &str = "plan_correction";
pub const FOLLOW_UP: &str = "follow_up";
pub const SUMMARIZATION: &str = "summarization";
pub const TASK_CONFIDENCE: &str = "task_confidence";
pub const TASK_EXECUTION: &str = "task_execution";

/// (id, 说明, 模板正文)
pub const DEFAULT_TEMPLATES: &[(&str, &str, &str)] = &[
    (
        REQUIREMENTS_GATHERING,
        "System prompt while collecting project requirements",
        r#"You are a senior software architect helping a user describe a software project.
Ask focused questions about goals, users, core features, technology preferences and constraints.
Ask at most three questions per reply and summarize what you already know.
When the user has described enough, tell them to say "ready for plan" to generate the phase plan."#,
    ),
    (
        REQUIREMENTS_ANALYSIS,
        "Condense the gathered conversation into a requirements summary",
        r#"Summarize the software requirements discussed in the conversation below.
Write a concise requirements document with sections for goals, features, technologies and constraints.
Do not invent requirements that were not mentioned.

Conversation:
{{conversation}}"#,
    ),
    (
        PHASE_GENERATION,
        "Request a strict-JSON phase plan",
        r#"You are a technical project planner. Break the requirements below into an ordered implementation plan.

Requirements:
{{requirements}}

Produce between {{min_phases}} and {{max_phases}} phases. Respond with a single JSON object inside a ```json fenced code block and nothing else. Schema:
{
  "title": "string",
  "description": "string",
  "phases": [
    {
      "id": "phase-001",
      "title": "string",
      "description": "string",
      "order": 1,
      "complexity": "low | medium | high",
      "dependencies": ["phase ids this phase depends on"],
      "tags": ["string"],
      "files": ["likely files touched"],
      "tasks": [
        {
          "id": "string",
          "title": "string",
          "goal": "string",
          "files": ["string"],
          "instructions": ["ordered steps"],
          "acceptanceCriteria": ["verifiable criteria"]
        }
      ]
    }
  ]
}
Every dependency must reference the id of another phase in the plan."#,
    ),
    (
        PLAN_CORRECTION,
        "Corrective retry after an unusable plan",
        r#"Your previous answer could not be used: {{error}}
Return strict JSON only: one JSON object in a ```json fenced code block, following the schema exactly, with between {{min_phases}} and {{max_phases}} phases. No commentary."#,
    ),
    (
        FOLLOW_UP,
        "System prompt for chat after the plan exists",
        r#"You are a senior software architect. A phase plan has already been produced for this project:

{{plan_summary}}

Answer the user's follow-up questions about the plan. If they ask for changes, explain them; the user can regenerate the plan with /regenerate."#,
    ),
    (
        SUMMARIZATION,
        "Summarize older turns when the context budget is exceeded",
        r#"Summarize the following conversation so it can replace the original messages.
Keep every requirement, decision and open question. Be concise.

{{conversation}}"#,
    ),
    (
        TASK_CONFIDENCE,
        "Ask how confidently a task can be completed",
        r#"Rate how confident you are that you can complete this task correctly right now.

Phase: {{phase_title}}
Task: {{task_title}}
Goal: {{task_goal}}
Acceptance criteria:
{{acceptance_criteria}}

Respond with JSON only: {"confidence": <integer 0-100>, "reasoning": "<one sentence>"}"#,
    ),
    (
        TASK_EXECUTION,
        "Execute one plan task",
        r#"You are executing a project plan step by step.

Plan: {{plan_title}}
Phase: {{phase_title}}
{{phase_description}}

Task: {{task_title}}
Goal: {{task_goal}}
Instructions:
{{instructions}}
Acceptance criteria:
{{acceptance_criteria}}
{{failure_context}}
Carry out the task and describe exactly what you did.
End your answer with {{completion_marker}} when every acceptance criterion is met, or {{failure_marker}} followed by the reason if you could not finish."#,
    ),
];
