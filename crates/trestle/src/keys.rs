//! Weighted-random credential selection.

use rand::Rng;
use thiserror::Error;

use crate::account::Key;
use crate::providers::ProviderKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeySelectionError {
    #[error("no keys found for provider: {0}")]
    NoKeys(ProviderKind),
    #[error("no keys found that support model: {0}")]
    NoKeysForModel(String),
}

/// Picks a credential for `model` from `keys`. A key qualifies when its model
/// list names the model (or is empty, the wildcard) and its value is
/// non-blank; Vertex keys may legitimately be blank since auth lives in the
/// provider metadata there. Weights are scaled to integers (x100) so the walk
/// avoids float accumulation.
///
/// The selector is stateless and safe to call concurrently.
pub fn select_key(
    keys: &[Key],
    provider: ProviderKind,
    model: &str,
) -> Result<Key, KeySelectionError> {
    if keys.is_empty() {
        return Err(KeySelectionError::NoKeys(provider));
    }

    let supported: Vec<&Key> = keys
        .iter()
        .filter(|key| {
            let matches_model = key.models.iter().any(|m| m == model)
                && (!key.value.trim().is_empty() || provider == ProviderKind::Vertex);
            matches_model || key.models.is_empty()
        })
        .collect();

    match supported.as_slice() {
        [] => Err(KeySelectionError::NoKeysForModel(model.to_string())),
        [only] => Ok((*only).clone()),
        candidates => {
            let total_weight: u64 = candidates
                .iter()
                .map(|key| (key.weight.max(0.0) * 100.0) as u64)
                .sum();
            if total_weight == 0 {
                return Ok(candidates[0].clone());
            }

            let pick = rand::thread_rng().gen_range(0..total_weight);
            let mut current = 0u64;
            for key in candidates {
                current += (key.weight.max(0.0) * 100.0) as u64;
                if pick < current {
                    return Ok((*key).clone());
                }
            }
            Ok(candidates[0].clone())
        }
    }
}
