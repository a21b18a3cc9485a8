//! Static question graph: situations, questions and their branch pointers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, FlowResult};

/// Yes/no question whose "yes" loops back from verification to implementation.
pub const RETURN_TO_IMPLEMENTATION: &str = "return-to-implementation-yesno";
/// Yes/no question whose "yes" closes the active cycle.
pub const CYCLE_COMPLETE: &str = "cycle-complete-yesno";
/// Question shown instead of looping when the transition guard blocks.
pub const LIMIT_REACHED: &str = "implementation-limit-reached";

const BUILTIN_FLOW: &str = include_str!("default_flow.json");

/// How a question is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    Text,
    YesNo,
    MultipleChoice,
}

/// One node of the question graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Accept several free-text entries saved as separate answers.
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_answer_next_situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_yes_next_question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_yes_next_situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_no_next_question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_no_next_situation: Option<String>,
    /// Question whose earlier answers are displayed alongside this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    /// Template filled from the prompt context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

impl Question {
    fn question_pointers(&self) -> impl Iterator<Item = &str> {
        [
            &self.next_question_id,
            &self.on_yes_next_question_id,
            &self.on_no_next_question_id,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }

    fn situation_pointers(&self) -> impl Iterator<Item = &str> {
        [
            &self.next_situation,
            &self.on_answer_next_situation,
            &self.on_yes_next_situation,
            &self.on_no_next_situation,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }
}

/// A situation and its ordered questions; the first is the start question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SituationDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub questions: Vec<Question>,
}

impl SituationDef {
    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn start_question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// The full question graph. Constructed only through validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCatalog {
    situations: Vec<SituationDef>,
}

impl FlowCatalog {
    /// Parse and validate a JSON catalog.
    pub fn from_json(json: &str) -> FlowResult<Self> {
        let catalog: FlowCatalog =
            serde_json::from_str(json).map_err(|e| FlowError::InvalidCatalog {
                message: format!("Failed to parse catalog: {}", e),
            })?;
        catalog.validate()?;
        debug!(
            situations = catalog.situations.len(),
            "Loaded flow catalog"
        );
        Ok(catalog)
    }

    /// Build a catalog from situations, validating it.
    pub fn from_situations(situations: Vec<SituationDef>) -> FlowResult<Self> {
        let catalog = Self { situations };
        catalog.validate()?;
        Ok(catalog)
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> FlowResult<Self> {
        Self::from_json(BUILTIN_FLOW)
    }

    pub fn situations(&self) -> &[SituationDef] {
        &self.situations
    }

    pub fn situation(&self, name: &str) -> FlowResult<&SituationDef> {
        self.situations
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FlowError::UnknownSituation {
                situation: name.to_string(),
            })
    }

    pub fn question(&self, situation: &str, question_id: &str) -> FlowResult<&Question> {
        self.situation(situation)?
            .question(question_id)
            .ok_or_else(|| FlowError::UnknownQuestion {
                situation: situation.to_string(),
                question_id: question_id.to_string(),
            })
    }

    pub fn start_question(&self, situation: &str) -> FlowResult<&Question> {
        let def = self.situation(situation)?;
        def.start_question()
            .ok_or_else(|| FlowError::InvalidCatalog {
                message: format!("Situation {} has no questions", situation),
            })
    }

    fn validate(&self) -> FlowResult<()> {
        let invalid = |message: String| Err(FlowError::InvalidCatalog { message });

        if self.situations.is_empty() {
            return invalid("Catalog has no situations".to_string());
        }

        let mut names = HashSet::new();
        for situation in &self.situations {
            if !names.insert(situation.name.as_str()) {
                return invalid(format!("Duplicate situation {}", situation.name));
            }
        }

        for situation in &self.situations {
            if situation.questions.is_empty() {
                return invalid(format!("Situation {} has no questions", situation.name));
            }

            let mut ids = HashSet::new();
            for question in &situation.questions {
                if !ids.insert(question.id.as_str()) {
                    return invalid(format!(
                        "Duplicate question '{}' in situation {}",
                        question.id, situation.name
                    ));
                }
            }

            for question in &situation.questions {
                if let Some(target) = question.question_pointers().find(|t| !ids.contains(t)) {
                    return invalid(format!(
                        "Question '{}' points at unknown question '{}'",
                        question.id, target
                    ));
                }
                if let Some(target) = question.situation_pointers().find(|t| !names.contains(t)) {
                    return invalid(format!(
                        "Question '{}' points at unknown situation {}",
                        question.id, target
                    ));
                }
                if question.kind == QuestionKind::MultipleChoice && question.options.is_empty() {
                    return invalid(format!("Question '{}' has no options", question.id));
                }
                if [RETURN_TO_IMPLEMENTATION, CYCLE_COMPLETE].contains(&question.id.as_str())
                    && question.kind != QuestionKind::YesNo
                {
                    return invalid(format!("Question '{}' must be yes-no", question.id));
                }
            }

            if ids.contains(RETURN_TO_IMPLEMENTATION) && !ids.contains(LIMIT_REACHED) {
                return invalid(format!(
                    "Situation {} has '{}' but no '{}'",
                    situation.name, RETURN_TO_IMPLEMENTATION, LIMIT_REACHED
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::situations::{SITUATION_CATALOG, VERIFYING};

    fn text(id: &str) -> Question {
        Question {
            id: id.to_string(),
            kind: QuestionKind::Text,
            text: id.to_string(),
            options: Vec::new(),
            allow_multiple: false,
            next_question_id: None,
            next_situation: None,
            on_answer_next_situation: None,
            on_yes_next_question_id: None,
            on_yes_next_situation: None,
            on_no_next_question_id: None,
            on_no_next_situation: None,
            data_source: None,
            prompt_template: None,
        }
    }

    fn situation(name: &str, questions: Vec<Question>) -> SituationDef {
        SituationDef {
            name: name.to_string(),
            description: None,
            questions,
        }
    }

    #[test]
    fn test_builtin_catalog_covers_every_situation() {
        let catalog = FlowCatalog::builtin().unwrap();
        let names: Vec<&str> = catalog.situations().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, SITUATION_CATALOG.to_vec());
    }

    #[test]
    fn test_builtin_special_questions() {
        let catalog = FlowCatalog::builtin().unwrap();
        for id in [RETURN_TO_IMPLEMENTATION, CYCLE_COMPLETE, LIMIT_REACHED] {
            let question = catalog.question(VERIFYING, id).unwrap();
            assert_eq!(question.kind, QuestionKind::YesNo);
        }
    }

    #[test]
    fn test_question_lookup_errors() {
        let catalog = FlowCatalog::builtin().unwrap();
        assert!(matches!(
            catalog.situation("Dreaming"),
            Err(FlowError::UnknownSituation { .. })
        ));
        assert!(matches!(
            catalog.question(VERIFYING, "missing"),
            Err(FlowError::UnknownQuestion { .. })
        ));
    }

    #[test]
    fn test_parse_camel_case_fields() {
        let json = r#"{"situations":[{"name":"A","questions":[
            {"id":"q1","type":"yes-no","text":"?","onYesNextSituation":"A","onNoNextQuestionId":"q2"},
            {"id":"q2","type":"text","text":"!","allowMultiple":true}
        ]}]}"#;
        let catalog = FlowCatalog::from_json(json).unwrap();
        let q1 = catalog.question("A", "q1").unwrap();
        assert_eq!(q1.on_yes_next_situation.as_deref(), Some("A"));
        assert_eq!(q1.on_no_next_question_id.as_deref(), Some("q2"));
        assert!(catalog.question("A", "q2").unwrap().allow_multiple);
    }

    #[test]
    fn test_rejects_dangling_question_pointer() {
        let mut q = text("q1");
        q.next_question_id = Some("nope".to_string());
        let err = FlowCatalog::from_situations(vec![situation("A", vec![q])]).unwrap_err();
        assert!(err.to_string().contains("unknown question 'nope'"));
    }

    #[test]
    fn test_rejects_dangling_situation_pointer() {
        let mut q = text("q1");
        q.next_situation = Some("Elsewhere".to_string());
        let err = FlowCatalog::from_situations(vec![situation("A", vec![q])]).unwrap_err();
        assert!(err.to_string().contains("unknown situation Elsewhere"));
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        assert!(FlowCatalog::from_situations(vec![]).is_err());
        assert!(FlowCatalog::from_situations(vec![situation("A", vec![])]).is_err());
        assert!(
            FlowCatalog::from_situations(vec![situation("A", vec![text("q"), text("q")])])
                .is_err()
        );
    }

    #[test]
    fn test_rejects_text_special_question() {
        let result =
            FlowCatalog::from_situations(vec![situation("A", vec![text(CYCLE_COMPLETE)])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_return_requires_limit_question() {
        let mut q = text(RETURN_TO_IMPLEMENTATION);
        q.kind = QuestionKind::YesNo;
        let result = FlowCatalog::from_situations(vec![situation("A", vec![q])]);
        assert!(result.unwrap_err().to_string().contains(LIMIT_REACHED));
    }

    #[test]
    fn test_multiple_choice_needs_options() {
        let mut q = text("pick");
        q.kind = QuestionKind::MultipleChoice;
        assert!(FlowCatalog::from_situations(vec![situation("A", vec![q])]).is_err());
    }
}
