//! Prompt templates for the two-stage extraction pipeline.
//!
//! Templates use `{name}` placeholders. Two names are reserved: `{input}` is
//! filled with the sample text when the question is built, and
//! `{stage1_answer}` with the literal stage-1 answer.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::scoring::ExperimentFamily;

pub const INPUT_PLACEHOLDER: &str = "input";
pub const STAGE1_ANSWER_PLACEHOLDER: &str = "stage1_answer";

const INPUT_SUFFIX: &str =
    "\nYour answer should be based on the following input: \n```\n{input}\n```";

// =============================================================================
// Templates
// =============================================================================

/// Which pipeline stage a template drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptStage {
    Extraction,
    Refinement,
}

impl PromptStage {
    /// 1-based stage index, as used in template file names.
    pub fn index(&self) -> u8 {
        match self {
            PromptStage::Extraction => 1,
            PromptStage::Refinement => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    slug: String,
    text: String,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

impl PromptTemplate {
    pub fn new(slug: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            text: text.into(),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Declared placeholder names, deduplicated, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for cap in placeholder_pattern().captures_iter(&self.text) {
            if let Some(name) = cap.get(1).map(|m| m.as_str()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute every placeholder present in `values`; others stay as is.
    pub fn render(&self, values: &HashMap<String, String>) -> String {
        placeholder_pattern()
            .replace_all(&self.text, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match values.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Content hash of the template text.
    pub fn hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

// =============================================================================
// Question building
// =============================================================================

/// Fill `{input}` with `context`, appending a fenced input section first if
/// the prompt does not mention `{input}`.
pub fn build_question(prompt: &str, context: &str) -> String {
    let mut question = prompt.to_string();
    if !question.contains("{input}") {
        question.push_str(INPUT_SUFFIX);
    }
    question.replace("{input}", context)
}

/// Wrap in Llama-2 instruction tags unless already wrapped.
pub fn add_llama_formatting(question: &str) -> String {
    let mut out = String::with_capacity(question.len() + 15);
    if !(question.starts_with("[INST]") || question.starts_with("<s>[INST]")) {
        out.push_str("[INST]");
    }
    out.push_str(question);
    if !question.ends_with("[/INST]") {
        out.push_str("[/INST]");
    }
    out
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const REPAIR_PROMPT: &str = r#"Convert the following text into a single valid JSON object.
Keep every field name and value that appears in the text. Use null for values that are not given.
Output only the JSON object, with no commentary.

```
{input}
```"#;

pub fn repair_template() -> PromptTemplate {
    PromptTemplate::new("repair_v1", REPAIR_PROMPT)
}

const PRICING_MODELS_STAGE1: &str = r#"You are a derivatives analyst. Read the trade description below and identify the instrument and its economic terms.

Return a JSON object with these fields:
- instrument_type: one of EuropeanOption, AmericanOption, BermudanOption, AsianOption, BarrierOption, DigitalOption, LookbackOption, CompoundOption, ChooserOption, SpreadOption, BasketOption, Forward, Future, VarianceSwap
- underlying: the underlying asset or index
- option_type: Call or Put, if applicable
- strike: the strike price as a number
- barrier: the barrier level as a number, if any
- notional: the notional amount as a number
- currency: ISO currency code
- trade_date, maturity_date: dates as YYYY-MM-DD
Use null for anything the description does not state.

Trade description:
{input}"#;

const PRICING_MODELS_STAGE2: &str = r#"A first pass classified the trade below as a {instrument_type} on {underlying}.

First pass answer:
{stage1_answer}

Re-read the trade description, correct any mistakes in the first pass, and fill in fields it missed. Keep instrument_type exactly as {instrument_type} unless the description clearly contradicts it.
Return only a JSON object with the same field names.

Trade description:
{input}"#;

const INTEREST_RATES_STAGE1: &str = r#"You are an interest-rate derivatives analyst. Read the trade description below and identify the instrument and its terms.

Return a JSON object with these fields:
- instrument_type: one of InterestRateSwap, OvernightIndexSwap, BasisSwap, CrossCurrencySwap, ForwardRateAgreement, Cap, Floor, Collar, Swaption, FixedRateBond, FloatingRateNote, ZeroCouponBond
- notional: the notional amount as a number
- currency: ISO currency code
- fixed_rate: the fixed rate or strike as a decimal number
- floating_index: the floating rate index, if any
- payment_frequency: e.g. 3M, 6M, 1Y
- effective_date, maturity_date: dates as YYYY-MM-DD
Use null for anything the description does not state.

Trade description:
{input}"#;

const INTEREST_RATES_STAGE2: &str = r#"A first pass classified the trade below as a {instrument_type} in {currency}.

First pass answer:
{stage1_answer}

Re-read the trade description, correct any mistakes in the first pass, and fill in fields it missed. Keep instrument_type exactly as {instrument_type} unless the description clearly contradicts it.
Return only a JSON object with the same field names.

Trade description:
{input}"#;

/// Built-in template for a family and stage.
pub fn default_template(family: ExperimentFamily, stage: PromptStage) -> PromptTemplate {
    let text = match (family, stage) {
        (ExperimentFamily::PricingModels, PromptStage::Extraction) => PRICING_MODELS_STAGE1,
        (ExperimentFamily::PricingModels, PromptStage::Refinement) => PRICING_MODELS_STAGE2,
        (ExperimentFamily::InterestRates, PromptStage::Extraction) => INTEREST_RATES_STAGE1,
        (ExperimentFamily::InterestRates, PromptStage::Refinement) => INTEREST_RATES_STAGE2,
    };
    PromptTemplate::new(format!("{}_stage{}", family.as_str(), stage.index()), text)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_appends_input_section_when_missing() {
        let q = build_question("Extract the trade terms.", "Buy 100 SPX calls");
        assert!(q.starts_with("Extract the trade terms.\nYour answer should be based on the following input:"));
        assert!(q.ends_with("```\nBuy 100 SPX calls\n```"));
    }

    #[test]
    fn question_fills_existing_input_placeholder() {
        let q = build_question("Input: {input}. Go.", "abc");
        assert_eq!(q, "Input: abc. Go.");
    }

    #[test]
    fn llama_formatting_is_idempotent() {
        let once = add_llama_formatting("hello");
        assert_eq!(once, "[INST]hello[/INST]");
        assert_eq!(add_llama_formatting(&once), once);
        assert_eq!(add_llama_formatting("<s>[INST]hi[/INST]"), "<s>[INST]hi[/INST]");
    }

    #[test]
    fn placeholders_skip_json_examples() {
        let t = PromptTemplate::new("t", r#"{a} then {"x": 1} then {b} and {a} again"#);
        assert_eq!(t.placeholders(), ["a", "b"]);
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let t = PromptTemplate::new("t", "{a} and {input}");
        let mut values = HashMap::new();
        values.insert("a".to_string(), "1".to_string());
        assert_eq!(t.render(&values), "1 and {input}");
    }

    #[test]
    fn default_templates_declare_reserved_placeholders() {
        for family in ExperimentFamily::ALL {
            let stage1 = default_template(family, PromptStage::Extraction);
            assert!(stage1.placeholders().contains(&INPUT_PLACEHOLDER));

            let stage2 = default_template(family, PromptStage::Refinement);
            let names = stage2.placeholders();
            assert!(names.contains(&"instrument_type"));
            assert!(names.contains(&STAGE1_ANSWER_PLACEHOLDER));
        }
        assert!(repair_template().placeholders().contains(&INPUT_PLACEHOLDER));
    }

    #[test]
    fn hash_tracks_text() {
        let a = PromptTemplate::new("x", "one");
        let b = PromptTemplate::new("y", "one");
        let c = PromptTemplate::new("x", "two");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
