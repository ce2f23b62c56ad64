//! Instrument-type resolution against a canonical vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::compare::Normalizer;

/// Experiment families. Each family has its own instrument vocabulary and
/// default stage prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentFamily {
    PricingModels,
    InterestRates,
}

impl ExperimentFamily {
    pub const ALL: [ExperimentFamily; 2] =
        [ExperimentFamily::PricingModels, ExperimentFamily::InterestRates];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentFamily::PricingModels => "pricing_models",
            ExperimentFamily::InterestRates => "interest_rates",
        }
    }

    pub fn default_vocabulary(&self) -> &'static [&'static str] {
        match self {
            ExperimentFamily::PricingModels => PRICING_MODEL_INSTRUMENTS,
            ExperimentFamily::InterestRates => INTEREST_RATE_INSTRUMENTS,
        }
    }
}

impl fmt::Display for ExperimentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "pricingmodels" => Ok(ExperimentFamily::PricingModels),
            "interestrates" => Ok(ExperimentFamily::InterestRates),
            _ => Err(format!("unknown experiment family: {s}")),
        }
    }
}

const PRICING_MODEL_INSTRUMENTS: &[&str] = &[
    "EuropeanOption",
    "AmericanOption",
    "BermudanOption",
    "AsianOption",
    "BarrierOption",
    "DigitalOption",
    "LookbackOption",
    "CompoundOption",
    "ChooserOption",
    "SpreadOption",
    "BasketOption",
    "Forward",
    "Future",
    "VarianceSwap",
];

const INTEREST_RATE_INSTRUMENTS: &[&str] = &[
    "InterestRateSwap",
    "OvernightIndexSwap",
    "BasisSwap",
    "CrossCurrencySwap",
    "ForwardRateAgreement",
    "Cap",
    "Floor",
    "Collar",
    "Swaption",
    "FixedRateBond",
    "FloatingRateNote",
    "ZeroCouponBond",
];

/// Map a noisy instrument label onto a vocabulary entry.
///
/// 1. Normalize the label.
/// 2. If that leaves nothing, adopt the first vocabulary term found as a
///    normalized substring of the whole answer.
/// 3. If the candidate is a vocabulary member, return it.
/// 4. Otherwise return the member with the highest similarity ratio.
///
/// Returns the canonical spelling. Only an empty vocabulary can produce a
/// non-member, in which case the normalized candidate is returned.
pub fn resolve_instrument_type(
    raw: &str,
    full_answer: &str,
    vocabulary: &[String],
    normalizer: &Normalizer,
) -> String {
    let normalized_vocab: Vec<String> = vocabulary.iter().map(|t| normalizer.normalize(t)).collect();
    let mut candidate = normalizer.normalize(raw);

    if candidate.is_empty() {
        let haystack = normalizer.normalize(full_answer);
        if let Some(term) = normalized_vocab
            .iter()
            .find(|t| !t.is_empty() && haystack.contains(t.as_str()))
        {
            candidate = term.clone();
        }
    }

    if let Some(idx) = normalized_vocab.iter().position(|t| *t == candidate) {
        return vocabulary[idx].clone();
    }

    let mut best: Option<(usize, f64)> = None;
    for (idx, term) in normalized_vocab.iter().enumerate() {
        let ratio = similarity_ratio(&candidate, term);
        if best.map_or(true, |(_, r)| ratio > r) {
            best = Some((idx, ratio));
        }
    }

    match best {
        Some((idx, ratio)) => {
            tracing::debug!(raw, resolved = %vocabulary[idx], ratio, "fuzzy-matched instrument type");
            vocabulary[idx].clone()
        }
        None => candidate,
    }
}

/// `1 - distance / longer_length`, in `[0, 1]`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / longest as f64
}

/// Levenshtein edit distance over chars.
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let b_len = b_chars.len();

    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row = vec![0; b_len + 1];

    for (i, a_char) in a.chars().enumerate() {
        curr_row[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = if a_char == *b_char { 0 } else { 1 };
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(family: ExperimentFamily) -> Vec<String> {
        family.default_vocabulary().iter().map(|s| s.to_string()).collect()
    }

    fn resolve(raw: &str, answer: &str) -> String {
        resolve_instrument_type(
            raw,
            answer,
            &vocab(ExperimentFamily::PricingModels),
            &Normalizer::new(),
        )
    }

    #[test]
    fn formatting_differences_resolve_exactly() {
        assert_eq!(resolve("European Option", ""), "EuropeanOption");
        assert_eq!(resolve("european-option", ""), "EuropeanOption");
        assert_eq!(resolve("BARRIER_OPTION", ""), "BarrierOption");
    }

    #[test]
    fn near_misses_pick_most_similar_member() {
        assert_eq!(resolve("Europian Optoin", ""), "EuropeanOption");
        assert_eq!(resolve("american", ""), "AmericanOption");
    }

    #[test]
    fn empty_label_scans_the_full_answer() {
        let answer = "The payoff looks like a digital option with cash settlement.";
        assert_eq!(resolve("", answer), "DigitalOption");
        assert_eq!(resolve(" - ", answer), "DigitalOption");
    }

    #[test]
    fn always_returns_a_vocabulary_member() {
        let members = vocab(ExperimentFamily::PricingModels);
        for raw in ["", "zzz", "swap", "a very long unrelated label"] {
            let resolved = resolve(raw, "nothing relevant");
            assert!(members.contains(&resolved), "{raw} -> {resolved}");
        }
    }

    #[test]
    fn empty_vocabulary_returns_normalized_candidate() {
        let out = resolve_instrument_type("Cap Floor", "", &[], &Normalizer::new());
        assert_eq!(out, "capfloor");
    }

    #[test]
    fn family_parsing_accepts_display_forms() {
        assert_eq!("PricingModels".parse::<ExperimentFamily>().unwrap(), ExperimentFamily::PricingModels);
        assert_eq!("interest_rates".parse::<ExperimentFamily>().unwrap(), ExperimentFamily::InterestRates);
        assert!("equities".parse::<ExperimentFamily>().is_err());
    }

    #[test]
    fn similarity_ratio_bounds() {
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", "abc"), 1.0);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        assert!((similarity_ratio("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
    }
}
