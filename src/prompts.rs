//! Instruction text, response schema and response validation for the prompt-optimizer call.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::models::OptimizedPrompt;

/// Every generated prompt must open with this phrase, verbatim.
pub const MANDATED_PREFIX: &str =
    "Create a portrait for me using the same face as in the attached file, 100% unchanged, 8K quality";

/// Number of proposals the instruction asks for.
pub const REQUESTED_PROPOSALS: usize = 4;

const PROPOSAL_FIELDS: [&str; 6] = ["title", "prompt", "camera", "lighting", "environment", "focalLength"];

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("empty response text")] EmptyText,
    #[error("response is not a proposal array: {0}")] Malformed(#[from] serde_json::Error),
    #[error("response contained no proposals")] NoProposals,
    #[error("proposal {index} ('{title}') does not start with the mandated phrase")]
    MissingPrefix { index: usize, title: String },
}

pub fn build_optimizer_instruction() -> String {
    format!(
        "I am providing two images:\n\
        1. A portrait of a model (first image).\n\
        2. A product or a product scene (second image).\n\
        \n\
        Your task is to generate {REQUESTED_PROPOSALS} diverse and professionally optimized photography prompts that place the model from the first image into a setting or context that fits the product from the second image.\n\
        \n\
        Each prompt must strictly adhere to these requirements:\n\
        1. It MUST start with the EXACT phrase: \"{MANDATED_PREFIX}\" (referring to the first image's face).\n\
        2. Analyze the product in the second image and create a background, props, or environment that perfectly complements or showcases that product.\n\
        3. Suggest a specific high-end camera (e.g., Sony A7R IV, Canon EOS R5, Leica M11).\n\
        4. Define a precise focal length (e.g., 35mm f/1.4, 85mm f/1.2, 50mm f/1.8).\n\
        5. Define a specific camera angle (e.g., low-angle hero shot, eye-level cinematic, product-focused composition).\n\
        6. Describe professional lighting that makes both the model and the product look premium (e.g., high-end commercial lighting, soft box diffusion, atmospheric gels).\n\
        \n\
        Return the response as a JSON array of {REQUESTED_PROPOSALS} objects."
    )
}

/// `responseSchema` for the optimizer call: an array of objects whose six string fields are all required.
pub fn proposal_response_schema() -> Value {
    let properties: serde_json::Map<String, Value> = PROPOSAL_FIELDS
        .iter()
        .map(|field| (field.to_string(), json!({ "type": "STRING" })))
        .collect();
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": properties,
            "required": PROPOSAL_FIELDS,
        }
    })
}

/// Validates the optimizer's JSON text against the proposal contract.
pub fn parse_proposals(text: &str) -> Result<Vec<OptimizedPrompt>, ContractError> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return Err(ContractError::EmptyText);
    }

    let proposals: Vec<OptimizedPrompt> = serde_json::from_str(body)?;
    if proposals.is_empty() {
        return Err(ContractError::NoProposals);
    }
    if let Some((index, p)) = proposals
        .iter()
        .enumerate()
        .find(|(_, p)| !p.prompt.trim_start().starts_with(MANDATED_PREFIX))
    {
        return Err(ContractError::MissingPrefix { index, title: p.title.clone() });
    }
    if proposals.len() != REQUESTED_PROPOSALS {
        warn!("⚠️ Expected {} proposals, service returned {}", REQUESTED_PROPOSALS, proposals.len());
    }
    Ok(proposals)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else { return text };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
