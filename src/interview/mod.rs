//! Typed intake interview.
//!
//! The interview is a fixed set of enumerated questions, each either
//! single- or multi-select over enumerated option labels. A
//! [`QuestionAgent`] supplies answers (interactively via `dialoguer`, or from
//! a scripted JSON file), every answer is checked against the question's
//! options, and the collected [`IntakeAnswers`] fold into an [`Intent`].

use anyhow::{Context, Result, bail};
use dialoguer::{MultiSelect, Select, theme::ColorfulTheme};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::document::{Constraints, Intent, Persona, SuccessMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionId {
    Personas,
    ComplianceScope,
    DeliveryPriority,
    RiskTolerance,
    SuccessMeasure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    SingleSelect,
    MultiSelect,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub id: QuestionId,
    pub prompt: &'static str,
    pub kind: QuestionKind,
    pub options: &'static [&'static str],
}

/// The intake question set, in asking order.
pub fn intake_questions() -> Vec<Question> {
    vec![
        Question {
            id: QuestionId::Personas,
            prompt: "Who will use this feature?",
            kind: QuestionKind::MultiSelect,
            options: &[
                "End user",
                "Administrator",
                "Developer",
                "Operator",
                "External partner",
            ],
        },
        Question {
            id: QuestionId::ComplianceScope,
            prompt: "Which compliance regimes apply?",
            kind: QuestionKind::MultiSelect,
            options: &["None", "GDPR", "HIPAA", "SOC 2", "PCI DSS"],
        },
        Question {
            id: QuestionId::DeliveryPriority,
            prompt: "What matters most for delivery?",
            kind: QuestionKind::SingleSelect,
            options: &["Speed to market", "Reliability", "Cost", "User experience"],
        },
        Question {
            id: QuestionId::RiskTolerance,
            prompt: "How much delivery risk is acceptable?",
            kind: QuestionKind::SingleSelect,
            options: &["Low", "Medium", "High"],
        },
        Question {
            id: QuestionId::SuccessMeasure,
            prompt: "How will success be measured?",
            kind: QuestionKind::MultiSelect,
            options: &["Adoption", "Revenue", "Performance", "Support load"],
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Single(String),
    Multi(Vec<String>),
}

/// Check that `answer` has the right shape for `question` and only uses its
/// option labels.
pub fn validate_answer(question: &Question, answer: &Answer) -> Result<()> {
    let chosen: Vec<&String> = match (question.kind, answer) {
        (QuestionKind::SingleSelect, Answer::Single(s)) => vec![s],
        (QuestionKind::MultiSelect, Answer::Multi(v)) => v.iter().collect(),
        (QuestionKind::SingleSelect, Answer::Multi(_)) => {
            bail!("Question {:?} takes a single option", question.id)
        }
        (QuestionKind::MultiSelect, Answer::Single(_)) => {
            bail!("Question {:?} takes a list of options", question.id)
        }
    };
    if let Some(bad) = chosen
        .iter()
        .find(|c| !question.options.contains(&c.as_str()))
    {
        bail!(
            "'{}' is not an option for {:?} (expected one of: {})",
            bad,
            question.id,
            question.options.join(", ")
        );
    }
    Ok(())
}

pub trait QuestionAgent {
    fn ask(&mut self, question: &Question) -> Result<Answer>;
}

/// Asks questions on the terminal.
pub struct DialoguerAgent {
    theme: ColorfulTheme,
}

impl Default for DialoguerAgent {
    fn default() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl QuestionAgent for DialoguerAgent {
    fn ask(&mut self, question: &Question) -> Result<Answer> {
        match question.kind {
            QuestionKind::SingleSelect => {
                let selection = Select::with_theme(&self.theme)
                    .with_prompt(question.prompt)
                    .items(question.options)
                    .default(0)
                    .interact()?;
                Ok(Answer::Single(question.options[selection].to_string()))
            }
            QuestionKind::MultiSelect => {
                let selections = MultiSelect::with_theme(&self.theme)
                    .with_prompt(question.prompt)
                    .items(question.options)
                    .interact()?;
                Ok(Answer::Multi(
                    selections
                        .into_iter()
                        .map(|i| question.options[i].to_string())
                        .collect(),
                ))
            }
        }
    }
}

/// Answers from a prepared map, e.g. loaded from `--answers <file.json>`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    answers: HashMap<QuestionId, Answer>,
}

impl ScriptedAgent {
    pub fn new(answers: HashMap<QuestionId, Answer>) -> Self {
        Self { answers }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read answers file: {}", path.display()))?;
        let answers = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse answers file: {}", path.display()))?;
        Ok(Self { answers })
    }
}

impl QuestionAgent for ScriptedAgent {
    fn ask(&mut self, question: &Question) -> Result<Answer> {
        self.answers
            .get(&question.id)
            .cloned()
            .with_context(|| format!("No scripted answer for {:?}", question.id))
    }
}

/// The record shaped by the chosen options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeAnswers {
    pub personas: Vec<String>,
    pub compliance: Vec<String>,
    pub delivery_priority: String,
    pub risk_tolerance: String,
    pub success_measures: Vec<String>,
}

impl IntakeAnswers {
    fn apply(&mut self, id: QuestionId, answer: Answer) {
        match (id, answer) {
            (QuestionId::Personas, Answer::Multi(v)) => self.personas = v,
            (QuestionId::ComplianceScope, Answer::Multi(v)) => {
                self.compliance = v.into_iter().filter(|c| c != "None").collect();
            }
            (QuestionId::DeliveryPriority, Answer::Single(s)) => self.delivery_priority = s,
            (QuestionId::RiskTolerance, Answer::Single(s)) => self.risk_tolerance = s,
            (QuestionId::SuccessMeasure, Answer::Multi(v)) => self.success_measures = v,
            // Shapes are checked by validate_answer before we get here.
            _ => {}
        }
    }

    pub fn into_intent(self, problem_statement: &str) -> Intent {
        let mut business = Vec::new();
        if !self.delivery_priority.is_empty() {
            business.push(format!("Delivery priority: {}", self.delivery_priority));
        }
        if !self.risk_tolerance.is_empty() {
            business.push(format!("Risk tolerance: {}", self.risk_tolerance));
        }

        Intent {
            problem_statement: problem_statement.to_string(),
            personas: self
                .personas
                .into_iter()
                .map(|name| Persona {
                    name,
                    description: String::new(),
                })
                .collect(),
            constraints: Constraints {
                technical: Vec::new(),
                compliance: self.compliance,
                business,
            },
            risks: Vec::new(),
            success_metrics: SuccessMetrics {
                quantitative: Vec::new(),
                qualitative: Vec::new(),
                business: self.success_measures,
            },
        }
    }
}

/// Ask every intake question and build the intent.
pub fn run_intake(agent: &mut dyn QuestionAgent, problem_statement: &str) -> Result<Intent> {
    if problem_statement.trim().is_empty() {
        bail!("Problem statement must not be empty");
    }
    let mut answers = IntakeAnswers::default();
    for question in intake_questions() {
        let answer = agent.ask(&question)?;
        validate_answer(&question, &answer)?;
        tracing::debug!(question = ?question.id, answer = ?answer, "intake answer");
        answers.apply(question.id, answer);
    }
    Ok(answers.into_intent(problem_statement))
}
