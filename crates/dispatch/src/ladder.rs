//! Ordered table of completion attempts

use key_pool::Tier;
use serde::Deserialize;

use crate::error::LadderError;

const MAX_TEMPERATURE: f32 = 2.0;

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttemptSpec {
    pub tier: Tier,
    pub model: String,
    pub temperature: f32,
}

impl AttemptSpec {
    fn new(tier: Tier, model: &str, temperature: f32) -> Self {
        Self {
            tier,
            model: model.to_string(),
            temperature,
        }
    }
}

/// Validated, immutable sequence of attempts. Its length is the attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLadder {
    attempts: Vec<AttemptSpec>,
}

impl Default for RetryLadder {
    /// Two pro attempts, then two flash attempts, alternating temperature.
    fn default() -> Self {
        Self {
            attempts: vec![
                AttemptSpec::new(Tier::Pro, "gemini-1.5-pro-latest", 1.0),
                AttemptSpec::new(Tier::Pro, "gemini-1.5-pro-latest", 0.5),
                AttemptSpec::new(Tier::Flash, "gemini-1.5-flash", 1.0),
                AttemptSpec::new(Tier::Flash, "gemini-1.5-flash", 0.5),
            ],
        }
    }
}

impl RetryLadder {
    pub fn new(attempts: Vec<AttemptSpec>) -> Result<Self, LadderError> {
        if attempts.is_empty() {
            return Err(LadderError::Empty);
        }
        for (index, rung) in attempts.iter().enumerate() {
            if rung.model.trim().is_empty() {
                return Err(LadderError::BlankModel { index });
            }
            if !rung.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&rung.temperature) {
                return Err(LadderError::Temperature {
                    index,
                    value: rung.temperature,
                });
            }
        }
        Ok(Self { attempts })
    }

    /// Build a ladder from parallel `(model, temperature)` pairs where the
    /// first `pro_attempts` entries use the pro tier and the rest use flash.
    pub fn split<M: Into<String>>(
        entries: impl IntoIterator<Item = (M, f32)>,
        pro_attempts: usize,
    ) -> Result<Self, LadderError> {
        let attempts = entries
            .into_iter()
            .enumerate()
            .map(|(i, (model, temperature))| AttemptSpec {
                tier: if i < pro_attempts { Tier::Pro } else { Tier::Flash },
                model: model.into(),
                temperature,
            })
            .collect();
        Self::new(attempts)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttemptSpec> {
        self.attempts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_is_pro_then_flash() {
        let ladder = RetryLadder::default();
        assert_eq!(ladder.len(), 4);
        let rungs: Vec<_> = ladder
            .iter()
            .map(|a| (a.tier, a.model.as_str(), a.temperature))
            .collect();
        assert_eq!(
            rungs,
            vec![
                (Tier::Pro, "gemini-1.5-pro-latest", 1.0),
                (Tier::Pro, "gemini-1.5-pro-latest", 0.5),
                (Tier::Flash, "gemini-1.5-flash", 1.0),
                (Tier::Flash, "gemini-1.5-flash", 0.5),
            ]
        );
    }

    #[test]
    fn split_reproduces_default_table() {
        let ladder = RetryLadder::split(
            [
                ("gemini-1.5-pro-latest", 1.0),
                ("gemini-1.5-pro-latest", 0.5),
                ("gemini-1.5-flash", 1.0),
                ("gemini-1.5-flash", 0.5),
            ],
            2,
        )
        .unwrap();
        assert_eq!(ladder, RetryLadder::default());
    }

    #[test]
    fn empty_ladder_is_rejected() {
        assert_eq!(RetryLadder::new(Vec::new()), Err(LadderError::Empty));
    }

    #[test]
    fn blank_model_is_rejected() {
        let err = RetryLadder::new(vec![
            AttemptSpec::new(Tier::Pro, "gemini-1.5-pro-latest", 1.0),
            AttemptSpec::new(Tier::Flash, "  ", 1.0),
        ])
        .unwrap_err();
        assert_eq!(err, LadderError::BlankModel { index: 1 });
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        for value in [-0.1, 2.5, f32::NAN] {
            let err = RetryLadder::new(vec![AttemptSpec::new(Tier::Pro, "m", value)]).unwrap_err();
            assert!(
                matches!(err, LadderError::Temperature { index: 0, .. }),
                "got: {err}"
            );
        }
    }

    #[test]
    fn attempts_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            ladder: Vec<AttemptSpec>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[ladder]]
            tier = "flash"
            model = "gemini-2.0-flash"
            temperature = 0.7
            "#,
        )
        .unwrap();
        let ladder = RetryLadder::new(doc.ladder).unwrap();
        let first = ladder.iter().next().unwrap();
        assert_eq!(first.tier, Tier::Flash);
        assert_eq!(first.model, "gemini-2.0-flash");
        assert_eq!(first.temperature, 0.7);
    }
}
