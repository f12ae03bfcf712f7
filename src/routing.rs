use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::mail::InboundMessage;
use crate::models::RoutingRuleRow;

pub const SENDER_MATCH_SCORE: i32 = 10;
pub const SUBJECT_MATCH_SCORE: i32 = 10;
pub const FILE_TYPE_MATCH_SCORE: i32 = 5;
pub const EMPLOYEE_CONTEXT_BONUS: i32 = 15;
pub const DEFAULT_PATH_TEMPLATE: &str = "Email Attachments/{year}/{month}";

const EMPLOYEE_PLACEHOLDERS: [&str; 2] = ["{employee_email}", "{employee_name}"];
const ILLEGAL_PATH_CHARS: [char; 8] = ['\\', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {rule_id}: invalid {field} pattern: {source}")]
    Pattern {
        rule_id: Uuid,
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("rule {rule_id}: malformed {field}: {source}")]
    Shape {
        rule_id: Uuid,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawConditions {
    #[serde(default)]
    sender_pattern: Option<String>,
    #[serde(default)]
    subject_pattern: Option<String>,
    #[serde(default)]
    file_types: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActions {
    #[serde(default)]
    storage_config_id: Option<Uuid>,
    #[serde(default)]
    destination_path: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Condition {
    SenderPattern(Regex),
    SubjectPattern(Regex),
    FileTypes(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct RuleActions {
    pub storage_config_id: Option<Uuid>,
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub actions: RuleActions,
}

impl RoutingRule {
    /// Validates the stored JSON blobs. Blank patterns and empty type lists
    /// count as unset.
    pub fn compile(row: &RoutingRuleRow) -> Result<Self, RuleError> {
        let raw: RawConditions = if row.conditions.is_null() {
            RawConditions::default()
        } else {
            serde_json::from_value(row.conditions.clone()).map_err(|source| RuleError::Shape {
                rule_id: row.id,
                field: "conditions",
                source,
            })?
        };
        let actions: RawActions = if row.actions.is_null() {
            RawActions::default()
        } else {
            serde_json::from_value(row.actions.clone()).map_err(|source| RuleError::Shape {
                rule_id: row.id,
                field: "actions",
                source,
            })?
        };

        let pattern = |value: Option<String>, field: &'static str| {
            value
                .filter(|p| !p.trim().is_empty())
                .map(|p| {
                    RegexBuilder::new(p.trim())
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| RuleError::Pattern {
                            rule_id: row.id,
                            field,
                            source,
                        })
                })
                .transpose()
        };

        let mut conditions = Vec::new();
        if let Some(regex) = pattern(raw.sender_pattern, "sender")? {
            conditions.push(Condition::SenderPattern(regex));
        }
        if let Some(regex) = pattern(raw.subject_pattern, "subject")? {
            conditions.push(Condition::SubjectPattern(regex));
        }
        let types: BTreeSet<String> = raw
            .file_types
            .unwrap_or_default()
            .iter()
            .map(|t| t.trim().trim_start_matches('.').to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if !types.is_empty() {
            conditions.push(Condition::FileTypes(types));
        }

        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            priority: row.priority,
            conditions,
            actions: RuleActions {
                storage_config_id: actions.storage_config_id,
                destination_path: actions
                    .destination_path
                    .filter(|path| !path.trim().is_empty()),
            },
        })
    }

    pub fn is_catch_all(&self) -> bool {
        self.conditions.is_empty()
    }

    fn uses_employee_placeholders(&self) -> bool {
        self.actions
            .destination_path
            .as_deref()
            .map_or(false, |path| {
                EMPLOYEE_PLACEHOLDERS.iter().any(|p| path.contains(p))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeContext {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingInput<'a> {
    pub sender_email: &'a str,
    pub subject: &'a str,
    pub extensions: &'a [String],
    pub employee: Option<&'a EmployeeContext>,
    pub open_request: Option<Uuid>,
}

impl<'a> RoutingInput<'a> {
    pub fn new(message: &'a InboundMessage, extensions: &'a [String]) -> Self {
        Self {
            sender_email: &message.sender_email,
            subject: &message.subject,
            extensions,
            employee: None,
            open_request: None,
        }
    }
}

/// Score for one rule, or `None` when a configured condition fails.
pub fn score_rule(rule: &RoutingRule, input: &RoutingInput<'_>) -> Option<i32> {
    let normalized = normalize_subject(input.subject);
    let mut score = 0;

    for condition in &rule.conditions {
        match condition {
            Condition::SenderPattern(regex) => {
                if !regex.is_match(input.sender_email) {
                    return None;
                }
                score += SENDER_MATCH_SCORE;
            }
            Condition::SubjectPattern(regex) => {
                if !regex.is_match(input.subject) && !regex.is_match(&normalized) {
                    return None;
                }
                score += SUBJECT_MATCH_SCORE;
            }
            Condition::FileTypes(types) => {
                let overlap = input
                    .extensions
                    .iter()
                    .any(|ext| types.contains(&ext.to_lowercase()));
                if !overlap {
                    return None;
                }
                score += FILE_TYPE_MATCH_SCORE;
            }
        }
    }

    if rule.is_catch_all()
        && rule.uses_employee_placeholders()
        && (input.employee.is_some() || input.open_request.is_some())
    {
        score += EMPLOYEE_CONTEXT_BONUS;
    }
    Some(score)
}

/// Highest score wins, then highest priority, then lowest id so the result
/// never depends on input order.
pub fn select_rule<'r>(rules: &'r [RoutingRule], input: &RoutingInput<'_>) -> Option<&'r RoutingRule> {
    rules
        .iter()
        .filter_map(|rule| score_rule(rule, input).map(|score| (score, rule)))
        .max_by(|(a_score, a), (b_score, b)| {
            a_score
                .cmp(b_score)
                .then(a.priority.cmp(&b.priority))
                .then(b.id.cmp(&a.id))
        })
        .map(|(_, rule)| rule)
}

/// Lowercases, collapses whitespace and strips any leading chain of reply or
/// forward markers and bracketed tags.
pub fn normalize_subject(subject: &str) -> String {
    let mut current = collapse_whitespace(&subject.to_lowercase());
    loop {
        let next = strip_prefix_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_prefix_once(value: &str) -> String {
    let trimmed = value.trim_start();
    if trimmed.starts_with('[') {
        if let Some(end) = trimmed.find(']') {
            return trimmed[end + 1..].trim().to_string();
        }
    }
    for marker in ["re", "fwd", "fw"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix(':') {
                return rest.trim().to_string();
            }
        }
    }
    trimmed.trim_end().to_string()
}

#[derive(Debug, Clone)]
pub struct PathContext<'a> {
    pub sender_email: &'a str,
    pub sender_name: Option<&'a str>,
    pub employee: Option<&'a EmployeeContext>,
    pub received_at: DateTime<Utc>,
}

pub fn render_path(template: &str, ctx: &PathContext<'_>) -> String {
    let sender_name = ctx
        .sender_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(ctx.sender_email);
    let (employee_email, employee_name) = match ctx.employee {
        Some(employee) => (employee.email.as_str(), employee.name.as_str()),
        None => (ctx.sender_email, sender_name),
    };

    let substitutions = [
        ("{sender_email}", sanitize_segment(ctx.sender_email)),
        ("{sender_name}", sanitize_segment(sender_name)),
        ("{employee_email}", sanitize_segment(employee_email)),
        ("{employee_name}", sanitize_segment(employee_name)),
        ("{date}", ctx.received_at.format("%Y-%m-%d").to_string()),
        ("{year}", ctx.received_at.format("%Y").to_string()),
        ("{month}", ctx.received_at.format("%m").to_string()),
    ];

    let mut rendered = template.to_string();
    for (placeholder, value) in &substitutions {
        rendered = rendered.replace(placeholder, value);
    }

    let cleaned: String = rendered
        .chars()
        .map(|c| {
            if ILLEGAL_PATH_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    cleaned
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_segment(value: &str) -> String {
    value.replace('/', "_")
}

pub fn default_path(received_at: DateTime<Utc>) -> String {
    render_path(
        DEFAULT_PATH_TEMPLATE,
        &PathContext {
            sender_email: "",
            sender_name: None,
            employee: None,
            received_at,
        },
    )
}

pub fn compile_all(rows: &[RoutingRuleRow]) -> (Vec<RoutingRule>, Vec<RuleError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    for row in rows.iter().filter(|row| row.is_active) {
        match RoutingRule::compile(row) {
            Ok(rule) => rules.push(rule),
            Err(err) => errors.push(err),
        }
    }
    (rules, errors)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn row(priority: i32, conditions: serde_json::Value, actions: serde_json::Value) -> RoutingRuleRow {
        let now = Utc::now().naive_utc();
        RoutingRuleRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            name: format!("rule-{priority}"),
            priority,
            is_active: true,
            conditions,
            actions,
            created_at: now,
            updated_at: now,
        }
    }

    fn input<'a>(sender: &'a str, subject: &'a str, extensions: &'a [String]) -> RoutingInput<'a> {
        RoutingInput {
            sender_email: sender,
            subject,
            extensions,
            employee: None,
            open_request: None,
        }
    }

    #[test]
    fn normalizes_reply_chains_and_tags() {
        assert_eq!(normalize_subject("Re: Re: Invoice"), normalize_subject("Invoice"));
        assert_eq!(normalize_subject("FWD: [External] RE:  W-2   2024"), "w-2 2024");
        assert_eq!(normalize_subject("Fw : hello"), "hello");
        assert_eq!(normalize_subject("Regarding taxes"), "regarding taxes");
    }

    #[test]
    fn normalization_is_idempotent() {
        for subject in ["Re: [x] Fwd: Bank statement ", "  ", "[open", "re:re:re:", "Fw: Re: A  b"] {
            let once = normalize_subject(subject);
            assert_eq!(normalize_subject(&once), once, "subject {subject:?}");
        }
    }

    #[test]
    fn specific_rule_beats_catch_all() {
        let specific = RoutingRule::compile(&row(
            5,
            json!({"sender_pattern": "^alice@", "subject_pattern": "invoice"}),
            json!({}),
        ))
        .unwrap();
        let catch_all = RoutingRule::compile(&row(1, json!({}), json!({}))).unwrap();
        let rules = vec![catch_all, specific.clone()];

        let extensions = vec!["pdf".to_string()];
        let input = input("alice@co.com", "Re: Invoice #2", &extensions);
        assert_eq!(score_rule(&specific, &input), Some(20));
        assert_eq!(score_rule(&rules[0], &input), Some(0));
        assert_eq!(select_rule(&rules, &input).unwrap().id, specific.id);
    }

    #[test]
    fn failing_configured_condition_eliminates_rule() {
        let rule = RoutingRule::compile(&row(
            1,
            json!({"sender_pattern": "@co\\.com$", "file_types": [".PDF"]}),
            json!({}),
        ))
        .unwrap();
        let docx = vec!["docx".to_string()];
        let pdf = vec!["pdf".to_string()];
        assert_eq!(score_rule(&rule, &input("a@co.com", "x", &docx)), None);
        assert_eq!(score_rule(&rule, &input("a@co.com", "x", &pdf)), Some(15));
        assert_eq!(score_rule(&rule, &input("a@other.com", "x", &pdf)), None);
    }

    #[test]
    fn ties_fall_back_to_priority_then_id() {
        let low = RoutingRule::compile(&row(1, json!({"subject_pattern": "w-2"}), json!({}))).unwrap();
        let high = RoutingRule::compile(&row(9, json!({"subject_pattern": "w-2"}), json!({}))).unwrap();
        let rules = vec![low, high.clone()];
        let input = input("x@y.com", "W-2 attached", &[]);
        assert_eq!(select_rule(&rules, &input).unwrap().id, high.id);

        let mut reversed = rules.clone();
        reversed.reverse();
        assert_eq!(select_rule(&reversed, &input).unwrap().id, high.id);
    }

    #[test]
    fn employee_catch_all_gets_bonus_with_context() {
        let employee_rule = RoutingRule::compile(&row(
            1,
            json!({}),
            json!({"destination_path": "Staff/{employee_name}"}),
        ))
        .unwrap();
        let employee = EmployeeContext {
            email: "dana@firm.com".into(),
            name: "Dana".into(),
        };
        let mut ctx = input("dana@firm.com", "hello", &[]);
        assert_eq!(score_rule(&employee_rule, &ctx), Some(0));
        ctx.employee = Some(&employee);
        assert_eq!(score_rule(&employee_rule, &ctx), Some(EMPLOYEE_CONTEXT_BONUS));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_compile_time() {
        let err = RoutingRule::compile(&row(1, json!({"sender_pattern": "(unclosed"}), json!({})))
            .unwrap_err();
        assert!(matches!(err, RuleError::Pattern { field: "sender", .. }));
    }

    #[test]
    fn renders_path_templates() {
        let received_at = Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap();
        let ctx = PathContext {
            sender_email: "alice@co.com",
            sender_name: Some("Alice: A/B"),
            employee: None,
            received_at,
        };
        assert_eq!(
            render_path("//Clients//{sender_name}/{year}/{month}/", &ctx),
            "Clients/Alice_ A_B/2024/03"
        );
        assert_eq!(
            render_path("Staff/{employee_email}/{date}", &ctx),
            "Staff/alice@co.com/2024-03-07"
        );
        assert_eq!(default_path(received_at), "Email Attachments/2024/03");
    }
}
