//! Question payload types and answer validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Chosen option key per question id.
pub type Answers = BTreeMap<String, String>;

/// The immutable content of a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Generator metadata (bank name, source info...). Opaque to the coordinator.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub questions: Vec<Question>,
}

/// One sub-question with a fixed set of labeled choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub qid: String,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub options: Vec<Choice>,

    /// Any further generator fields, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub key: String,
    #[serde(default)]
    pub text: String,
}

/// Why an answer set is not a complete, valid response to a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerProblem {
    /// Question left unanswered. `number` is 1-based.
    Missing { number: usize, qid: String },
    /// Answer names a key that is not one of the question's options.
    UnknownChoice { qid: String, choice: String },
    /// Answer for a question id the payload does not contain.
    UnknownQuestion { qid: String },
}

impl std::fmt::Display for AnswerProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerProblem::Missing { number, qid } => {
                write!(f, "question {number} ({qid}) is unanswered")
            }
            AnswerProblem::UnknownChoice { qid, choice } => {
                write!(f, "question {qid} has no option '{choice}'")
            }
            AnswerProblem::UnknownQuestion { qid } => write!(f, "no question with id {qid}"),
        }
    }
}

impl Payload {
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn question(&self, qid: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.qid == qid)
    }

    /// Check an answer set against this payload. Empty means complete and valid.
    ///
    /// Problems are reported in question order, then unknown question ids.
    pub fn validate_answers(&self, answers: &Answers) -> Vec<AnswerProblem> {
        let mut problems = Vec::new();

        for (i, q) in self.questions.iter().enumerate() {
            match answers.get(&q.qid) {
                None => problems.push(AnswerProblem::Missing {
                    number: i + 1,
                    qid: q.qid.clone(),
                }),
                Some(choice) if !q.has_choice(choice) => {
                    problems.push(AnswerProblem::UnknownChoice {
                        qid: q.qid.clone(),
                        choice: choice.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for qid in answers.keys() {
            if self.question(qid).is_none() {
                problems.push(AnswerProblem::UnknownQuestion { qid: qid.clone() });
            }
        }

        problems
    }
}

impl Question {
    pub fn has_choice(&self, key: &str) -> bool {
        // Options-less questions accept free-form keys.
        self.options.is_empty() || self.options.iter().any(|o| o.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Payload {
        serde_json::from_value(json!({
            "meta": {"bank": "bank_01"},
            "questions": [
                {"qid": "q1", "prompt": "first", "options": [{"key": "A", "text": "yes"}, {"key": "B", "text": "no"}]},
                {"qid": "q2", "prompt": "second", "options": [{"key": "A", "text": "yes"}, {"key": "B", "text": "no"}], "label": "L3"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn extra_question_fields_are_preserved() {
        let p = payload();
        assert_eq!(p.questions[1].extra.get("label"), Some(&json!("L3")));
        let back = serde_json::to_value(&p.questions[1]).unwrap();
        assert_eq!(back["label"], json!("L3"));
    }

    #[test]
    fn complete_answers_validate_clean() {
        let answers = Answers::from([("q1".into(), "A".into()), ("q2".into(), "B".into())]);
        assert!(payload().validate_answers(&answers).is_empty());
    }

    #[test]
    fn reports_missing_with_one_based_numbers() {
        let answers = Answers::from([("q1".into(), "A".into())]);
        assert_eq!(
            payload().validate_answers(&answers),
            vec![AnswerProblem::Missing {
                number: 2,
                qid: "q2".into()
            }]
        );
    }

    #[test]
    fn reports_unknown_choice_and_question() {
        let answers = Answers::from([
            ("q1".into(), "C".into()),
            ("q2".into(), "A".into()),
            ("q9".into(), "A".into()),
        ]);
        let problems = payload().validate_answers(&answers);
        assert_eq!(problems.len(), 2);
        assert!(matches!(&problems[0], AnswerProblem::UnknownChoice { qid, .. } if qid == "q1"));
        assert!(matches!(&problems[1], AnswerProblem::UnknownQuestion { qid } if qid == "q9"));
    }
}
