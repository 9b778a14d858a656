//! Bounded context assembly for step inputs.
//!
//! Items are packed by priority class under a hard token budget. CRITICAL
//! items are never dropped, HIGH items are truncated when needed, MEDIUM
//! items are dropped before HIGH is touched, and LOW items go first. The
//! drop order is deterministic and ends up in the receipt's
//! `budget_overflow` field; an overrun documents drops, it never fails the
//! step.

use serde::{Deserialize, Serialize};

/// Priority class of a context item. Declaration order within a class is
/// preserved; drops take later declarations first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Teaching notes and the current step spec. Never dropped.
    Critical,
    /// Previous handoff and bound artifacts. Truncated if needed.
    High,
    /// Referenced artifacts, loaded on demand.
    Medium,
    /// History summaries and scent excerpts. Dropped first.
    Low,
}

/// One candidate item for the prompt pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub label: String,
    pub priority: Priority,
    pub text: String,
}

impl ContextItem {
    pub fn new(label: impl Into<String>, priority: Priority, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            priority,
            text: text.into(),
        }
    }
}

/// Input/output budget for one agent role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoleBudget {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RoleBudget {
    /// Per-role defaults. Unknown roles get the conservative default.
    pub fn for_role(role: &str) -> Self {
        match role {
            "implementer" => Self {
                input_tokens: 30_000,
                output_tokens: 10_000,
            },
            "critic" => Self {
                input_tokens: 25_000,
                output_tokens: 5_000,
            },
            "navigator" => Self {
                input_tokens: 2_000,
                output_tokens: 500,
            },
            _ => Self {
                input_tokens: 20_000,
                output_tokens: 5_000,
            },
        }
    }
}

/// One packed section, possibly truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedSection {
    pub label: String,
    pub priority: Priority,
    pub text: String,
    pub truncated: bool,
}

/// The assembled input for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPack {
    pub role: String,
    pub sections: Vec<PackedSection>,
    pub output_token_budget: u64,
    /// Present when the backend lacks native structured output and the
    /// kernel subsumes it with a schema prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_instruction: Option<String>,
}

impl PromptPack {
    /// Flatten sections into one prompt body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str("## ");
            out.push_str(&section.label);
            if section.truncated {
                out.push_str(" (truncated)");
            }
            out.push('\n');
            out.push_str(&section.text);
            out.push_str("\n\n");
        }
        if let Some(instruction) = &self.schema_instruction {
            out.push_str(instruction);
            out.push('\n');
        }
        out
    }

    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.render())
    }
}

/// Result of packing: the pack plus what was dropped or truncated, in drop
/// order.
#[derive(Debug, Clone)]
pub struct PackOutcome {
    pub pack: PromptPack,
    pub overflow: Vec<String>,
}

/// Schema prompt injected when a backend lacks `structured_output`.
pub const SCHEMA_INSTRUCTION: &str = "Reply with exactly one fenced json block containing the \
handoff envelope: {\"status\": \"VERIFIED|UNVERIFIED|BLOCKED\", \"summary\": {\"what_i_did\", \
\"what_i_found\", \"key_decisions\", \"evidence\"}, \"concerns\": [], \"assumptions\": [], \
\"routing\": {\"recommendation\", \"can_further_iteration_help\", \"reason\"}}";

/// Rough token estimate; four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64) / 4 + 1
}

/// Pack `items` for `role` under `budget`.
///
/// Drop order: LOW (latest declared first), then MEDIUM, then HIGH is
/// truncated (latest first). CRITICAL survives even a blown budget; that
/// case is recorded as `critical_over_budget` in the overflow list.
pub fn pack(
    role: &str,
    items: Vec<ContextItem>,
    budget: RoleBudget,
    needs_schema_prompt: bool,
) -> PackOutcome {
    let mut overflow: Vec<String> = Vec::new();

    let mut sections: Vec<PackedSection> = Vec::new();
    for class in [Priority::Critical, Priority::High, Priority::Medium, Priority::Low] {
        for item in items.iter().filter(|i| i.priority == class) {
            sections.push(PackedSection {
                label: item.label.clone(),
                priority: item.priority,
                text: item.text.clone(),
                truncated: false,
            });
        }
    }

    let instruction_cost = if needs_schema_prompt {
        estimate_tokens(SCHEMA_INSTRUCTION)
    } else {
        0
    };

    let total = |sections: &[PackedSection]| -> u64 {
        sections
            .iter()
            .map(|s| estimate_tokens(&s.text) + estimate_tokens(&s.label))
            .sum::<u64>()
            + instruction_cost
    };

    // Drop LOW then MEDIUM, latest declarations first.
    for class in [Priority::Low, Priority::Medium] {
        while total(&sections) > budget.input_tokens {
            let Some(pos) = sections.iter().rposition(|s| s.priority == class) else {
                break;
            };
            let removed = sections.remove(pos);
            overflow.push(format!("dropped:{}", removed.label));
        }
    }

    // Truncate HIGH items, latest first, until the pack fits.
    let mut idx = sections.len();
    while total(&sections) > budget.input_tokens && idx > 0 {
        idx -= 1;
        if sections[idx].priority != Priority::High {
            continue;
        }
        let over_tokens = total(&sections) - budget.input_tokens;
        let section = &mut sections[idx];
        let keep_chars = section
            .text
            .chars()
            .count()
            .saturating_sub((over_tokens as usize) * 4);
        section.text = section.text.chars().take(keep_chars).collect();
        section.truncated = true;
        overflow.push(format!("truncated:{}", section.label));
    }

    if total(&sections) > budget.input_tokens {
        overflow.push("critical_over_budget".to_string());
    }

    PackOutcome {
        pack: PromptPack {
            role: role.to_string(),
            sections,
            output_token_budget: budget.output_tokens,
            schema_instruction: needs_schema_prompt.then(|| SCHEMA_INSTRUCTION.to_string()),
        },
        overflow,
    }
}
