use bundlelab_core::classify::{ErrorCode, ErrorReport};
use bundlelab_core::matcher::RelatedBundle;
use bundlelab_core::rating::RatingNote;
use bundlelab_core::session::{ItemCatalog, Session, PRODUCT_PREFIX};
use serde_json::{Map, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

const BUNDLE_FORMAT: &str = r#"IMPORTANT: Your response MUST follow this exact JSON format without any additional text:
{
  "bundle1": ["product1", "product2", "product3"],
  "bundle2": ["product4", "product5"],
  ...
}

Each bundle key should be in the format 'bundle1', 'bundle2', etc.
Each product should be referred to by its product number exactly as shown above.
DO NOT include any explanations, comments, or additional text in your response."#;

const INTENT_FORMAT: &str = r#"IMPORTANT: Your response MUST follow this exact JSON format without any additional text:
{
  "bundle1": "intent description here",
  "bundle2": "intent description here",
  ...
}

Each bundle key should be in the format 'bundle1', 'bundle2', etc.
DO NOT include any explanations, comments, or additional text in your response."#;

/// `{"product1": "<title>", ...}` for a session.
pub fn product_listing(session: &Session) -> String {
    let listing: Map<String, Value> = session
        .product_listing()
        .into_iter()
        .map(|(label, title)| (label, Value::String(title)))
        .collect();
    Value::Object(listing).to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUNDLE DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn bundle_detection_prompt(session: &Session) -> String {
    format!(
        "A bundle can be a set of alternative or complementary products that are purchased with a certain intent.\n\
         Please detect bundles from a sequence of products. Each bundle must contain multiple products.\n\n\
         Here are the products and descriptions: {}.\n\n{}",
        product_listing(session),
        BUNDLE_FORMAT
    )
}

pub const SELF_CORRECTION_ROUNDS: usize = 3;

/// Intent generation, bundle re-adjustment, intent regeneration.
pub fn self_correction_prompt(round: usize) -> String {
    match round {
        0 => format!(
            "Please generate intents behind the detected bundles using 3 to 5 words for each intent.\n\n{}",
            INTENT_FORMAT
        ),
        1 => format!(
            "Given the generated intents, adjust the detected bundles with the product descriptions.\n\n{}",
            BUNDLE_FORMAT
        ),
        _ => format!(
            "Given the adjusted bundles, regenerate the intents behind each bundle.\n\n{}",
            INTENT_FORMAT
        ),
    }
}

fn feedback_phrase(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::NoErrors => "correct.",
        ErrorCode::Empty => "empty. Please generate non-empty bundles.",
        ErrorCode::NotConvertible => "not convertible to a dictionary. Please ensure proper format.",
        ErrorCode::NotAMapping => "of incorrect type. Please use a dictionary format.",
        ErrorCode::NonTextItem => "invalid. Items should be strings.",
        ErrorCode::Hallucination => {
            "containing hallucinated products. Please only use products that are in the session."
        }
        ErrorCode::UncoveredGroundTruth => {
            "not found in ground truth. Please check bundle composition."
        }
    }
}

/// Corrective feedback for every defect in the report.
pub fn bundle_feedback_prompt(report: &ErrorReport) -> String {
    if report.is_success() {
        return "There are no errors in the bundles.".to_string();
    }
    let mut prompt = String::from("Based on the bundles you provided, I've identified some issues:\n\n");
    for (code, description) in report.iter() {
        if code == ErrorCode::NoErrors {
            continue;
        }
        prompt.push_str(&format!(
            "- The bundles {} are {}\n",
            description,
            feedback_phrase(code)
        ));
    }
    prompt.push_str("\nPlease adjust your bundles accordingly and provide the updated version.\n\n");
    prompt.push_str(BUNDLE_FORMAT);
    prompt
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTENTS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn intent_regeneration_prompt() -> String {
    format!(
        "Given the adjusted bundles, regenerate the intents behind each bundle. \
         Each intent should be 3-5 words describing the shared purchase motivation.\n\n{}",
        INTENT_FORMAT
    )
}

const RATER_RUBRIC: &str = r#"The intent should describe the customer motivation well in the purchase of the product bundles. You are asked to evaluate two intents for a bundle, using three metrics: Naturalness, Coverage, and Motivation. The details and scales of each metric are listed below:

Naturalness:
1-the intent is difficult to read and understand.
2-the intent is fair to read and understand.
3-the intent is easy to read and understand.

Coverage:
1-only a few items in the bundle are covered by the intent.
2-around half items in the bundle are covered by the intent.
3-most items in the bundle are covered by the intent.

Motivation:
1-the intent contains no motivational description.
2-the intent contains motivational description.

Following are the bundles that we ask you to evaluate:
"#;

const RATER_FORMAT: &str = r#"IMPORTANT: Your response MUST be a valid, complete JSON object - make sure ALL brackets are properly closed.
Follow this exact JSON format without ANY additional text or explanations:
{
  "bundle1": {
    "intent1": [Naturalness_score, Coverage_score, Motivation_score],
    "intent2": [Naturalness_score, Coverage_score, Motivation_score]
  },
  "bundle2": {
    "intent1": [Naturalness_score, Coverage_score, Motivation_score],
    "intent2": [Naturalness_score, Coverage_score, Motivation_score]
  }
}

The JSON object MUST be properly formatted and closed with a final } bracket.
Use only numeric values (1, 2, or 3) for scores.
DO NOT include any explanations, comments, or additional text outside of this JSON structure."#;

/// Rating request for the related bundles of one session. `Bundle<i>` follows
/// the order of `related`; intent1 is the generated intent, intent2 the
/// reference one.
pub fn intent_rating_prompt(related: &[RelatedBundle], catalog: &ItemCatalog) -> String {
    let mut prompt = String::from(RATER_RUBRIC);
    for (idx, bundle) in related.iter().enumerate() {
        let products: Map<String, Value> = bundle
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| {
                (
                    format!("{}{}", PRODUCT_PREFIX, pos + 1),
                    Value::String(catalog.title(item).to_string()),
                )
            })
            .collect();
        let intents = serde_json::json!({
            "intent1": bundle.intent,
            "intent2": bundle.ground_truth_intent,
        });
        prompt.push_str(&format!(
            "Bundle{}: {}\n{}\n",
            idx + 1,
            Value::Object(products),
            intents
        ));
    }
    prompt.push('\n');
    prompt.push_str(RATER_FORMAT);
    prompt
}

/// Improvement request for intents raters scored below the midpoint.
pub fn intent_correction_prompt(notes: &[RatingNote]) -> String {
    if notes.is_empty() {
        return "There are no issues with the intents.".to_string();
    }
    let mut prompt = String::from("Based on the intents you provided, I've identified some issues:\n\n");
    for note in notes {
        let dimensions: Vec<&str> = note.dimensions.iter().map(|dim| dim.as_str()).collect();
        prompt.push_str(&format!(
            "- For bundle {}, please improve the intent in terms of {}.\n",
            note.label,
            dimensions.join(" and ")
        ));
    }
    prompt.push_str("\nPlease provide updated intents for these bundles.\n\n");
    prompt.push_str(INTENT_FORMAT);
    prompt
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELD-OUT TEST
// ═══════════════════════════════════════════════════════════════════════════════

pub const RULES_SUMMARY_PROMPT: &str =
    "Based on conversations above, which rules do you find when detecting bundles?";

pub fn test_detection_prompt(session: &Session) -> String {
    format!(
        "Based on the rules, detect bundles for the below product sequence:\n\n{}\n\n{}",
        product_listing(session),
        BUNDLE_FORMAT
    )
}

pub const TEST_INTENT_PROMPT: &str = "Please use 3 to 5 words to generate intents behind the detected bundles, the output format is: {'bundle number':'intent'}";
