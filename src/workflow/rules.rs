//! Optimization-strategy rules applied during planning.
//!
//! A rule is a set of conditions over [`PlanningFacts`] plus one action on
//! the candidate list. Conditions are written `field.op.value` in config
//! (`initial_score.lt.0.5`, `entity_type.eq.chunk`) and compiled into
//! [`Condition`] values that [`evaluate`] interprets.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::job::{EntityType, Improvement, Priority};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    EntityType,
    Priority,
    InitialScore,
    IssueCount,
    CriticalIssues,
    ResourceUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: Field,
    pub op: Operator,
    pub value: Literal,
}

impl FromStr for Condition {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(OrchestratorError::Config(format!(
                "rule condition `{s}` must look like field.op.value"
            )));
        };

        let field = match field {
            "entity_type" => Field::EntityType,
            "priority" => Field::Priority,
            "initial_score" => Field::InitialScore,
            "issue_count" => Field::IssueCount,
            "critical_issues" => Field::CriticalIssues,
            "resource_usage" => Field::ResourceUsage,
            other => {
                return Err(OrchestratorError::Config(format!("unknown rule field `{other}`")));
            }
        };
        let op = match op {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "lt" => Operator::Lt,
            "le" | "lte" => Operator::Le,
            "gt" => Operator::Gt,
            "ge" | "gte" => Operator::Ge,
            other => {
                return Err(OrchestratorError::Config(format!("unknown rule operator `{other}`")));
            }
        };
        let value = match value.parse::<f64>() {
            Ok(n) => Literal::Number(n),
            Err(_) => Literal::Text(value.to_string()),
        };

        Ok(Condition { field, op, value })
    }
}

/// What planning knows about the job and its entity.
#[derive(Debug, Clone)]
pub struct PlanningFacts {
    pub entity_type: EntityType,
    pub priority: Priority,
    pub initial_score: f64,
    pub issue_count: usize,
    pub critical_issues: usize,
    pub resource_usage: f64,
}

enum Value {
    Number(f64),
    Text(String),
}

fn lookup(field: Field, facts: &PlanningFacts) -> Value {
    match field {
        Field::EntityType => Value::Text(facts.entity_type.to_string()),
        Field::Priority => Value::Text(facts.priority.to_string()),
        Field::InitialScore => Value::Number(facts.initial_score),
        Field::IssueCount => Value::Number(facts.issue_count as f64),
        Field::CriticalIssues => Value::Number(facts.critical_issues as f64),
        Field::ResourceUsage => Value::Number(facts.resource_usage),
    }
}

/// Interprets one condition. Type mismatches evaluate to false.
pub fn evaluate(condition: &Condition, facts: &PlanningFacts) -> bool {
    match (lookup(condition.field, facts), &condition.value) {
        (Value::Number(actual), Literal::Number(expected)) => {
            let expected = *expected;
            match condition.op {
                Operator::Eq => (actual - expected).abs() < f64::EPSILON,
                Operator::Ne => (actual - expected).abs() >= f64::EPSILON,
                Operator::Lt => actual < expected,
                Operator::Le => actual <= expected,
                Operator::Gt => actual > expected,
                Operator::Ge => actual >= expected,
            }
        }
        (Value::Text(actual), Literal::Text(expected)) => match condition.op {
            Operator::Eq => actual == *expected,
            Operator::Ne => actual != *expected,
            _ => false,
        },
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Add to the computed target score.
    RaiseTarget(f64),
    /// Remove candidates of this kind.
    DropKind(String),
    /// Keep at most this many improvements.
    Cap(usize),
    /// Require at least this drop in resource usage at validation.
    RequireResourceReduction(f64),
}

/// A rule as written in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    #[serde(default)]
    pub when: Vec<String>,
    pub action: RuleAction,
}

impl RuleSpec {
    pub fn compile(&self) -> Result<Rule> {
        let conditions = self
            .when
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<Condition>>>()?;
        Ok(Rule {
            name: self.name.clone(),
            entity_types: self.entity_types.clone(),
            conditions,
            action: self.action.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    /// Empty matches every entity type.
    pub entity_types: Vec<EntityType>,
    pub conditions: Vec<Condition>,
    pub action: RuleAction,
}

impl Rule {
    pub fn matches(&self, facts: &PlanningFacts) -> bool {
        (self.entity_types.is_empty() || self.entity_types.contains(&facts.entity_type))
            && self.conditions.iter().all(|c| evaluate(c, facts))
    }
}

/// Built-in strategy applied before configured rules.
pub fn default_rules() -> Vec<Rule> {
    let specs = [
        RuleSpec {
            name: "chunk-focus".into(),
            entity_types: vec![EntityType::Chunk],
            when: vec![],
            action: RuleAction::Cap(3),
        },
        RuleSpec {
            name: "near-target".into(),
            entity_types: vec![],
            when: vec!["initial_score.ge.0.85".into()],
            action: RuleAction::Cap(2),
        },
        RuleSpec {
            name: "system-resource-trim".into(),
            entity_types: vec![EntityType::System],
            when: vec!["resource_usage.ge.0.8".into()],
            action: RuleAction::RequireResourceReduction(0.1),
        },
    ];
    specs
        .iter()
        .filter_map(|spec| spec.compile().ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub improvements: Vec<Improvement>,
    pub target_score: f64,
    pub resource_reduction_target: f64,
    pub applied_rules: Vec<String>,
}

/// Refines candidate improvements into a plan.
#[derive(Debug, Clone)]
pub struct Planner {
    rules: Vec<Rule>,
}

impl Planner {
    pub fn new(extra: &[RuleSpec]) -> Result<Self> {
        let mut rules = default_rules();
        for spec in extra {
            rules.push(spec.compile()?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn plan(
        &self,
        facts: &PlanningFacts,
        candidates: Vec<Improvement>,
        base_reduction: f64,
    ) -> PlanOutcome {
        let mut improvements = candidates;
        // Most severe first, then biggest expected gain.
        improvements.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(b.expected_gain.total_cmp(&a.expected_gain))
        });

        let mut raise = 0.0;
        let mut reduction = base_reduction;
        let mut applied_rules = Vec::new();

        for rule in self.rules.iter().filter(|r| r.matches(facts)) {
            match &rule.action {
                RuleAction::RaiseTarget(delta) => raise += delta,
                RuleAction::DropKind(kind) => improvements.retain(|i| &i.kind != kind),
                RuleAction::Cap(n) => improvements.truncate(*n),
                RuleAction::RequireResourceReduction(r) => reduction = reduction.max(*r),
            }
            applied_rules.push(rule.name.clone());
        }

        let gain: f64 = improvements.iter().map(|i| i.expected_gain).sum();
        let target_score = (facts.initial_score + gain + raise).clamp(facts.initial_score, 1.0);

        PlanOutcome {
            improvements,
            target_score,
            resource_reduction_target: reduction,
            applied_rules,
        }
    }
}
