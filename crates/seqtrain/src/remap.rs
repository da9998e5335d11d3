use std::collections::{HashMap, HashSet};

use crate::error::{Result, TrainingError};

const WRAPPER_PREFIX: &str = "module.";

/// Decides which live parameter each stored tensor belongs to.
pub trait NameMatcher {
    /// Returns `stored name -> live name` for every stored entry.
    fn remap(
        &self,
        stored: &[(String, Vec<usize>)],
        live: &[(String, Vec<usize>)],
    ) -> Result<HashMap<String, String>>;
}

/// Strips data-parallel `module.` prefixes, keeps identical names, and pairs
/// whatever is left by ascending `(shape, name)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeOrderMatcher;

impl NameMatcher for ShapeOrderMatcher {
    fn remap(
        &self,
        stored: &[(String, Vec<usize>)],
        live: &[(String, Vec<usize>)],
    ) -> Result<HashMap<String, String>> {
        if stored.len() != live.len() {
            return Err(TrainingError::runtime(format!(
                "checkpoint holds {} tensors but the model has {} parameters",
                stored.len(),
                live.len()
            )));
        }

        let live_shapes: HashMap<&str, &Vec<usize>> = live
            .iter()
            .map(|(name, shape)| (name.as_str(), shape))
            .collect();

        let mut mapping = HashMap::with_capacity(stored.len());
        let mut claimed = HashSet::new();
        let mut leftover_stored = Vec::new();
        for (name, shape) in stored {
            let bare = strip_wrapper(name);
            match live_shapes.get(bare) {
                Some(live_shape) if *live_shape == shape && !claimed.contains(bare) => {
                    claimed.insert(bare.to_string());
                    mapping.insert(name.clone(), bare.to_string());
                }
                _ => leftover_stored.push((bare, name, shape)),
            }
        }

        let mut leftover_live: Vec<_> = live
            .iter()
            .filter(|(name, _)| !claimed.contains(name.as_str()))
            .collect();

        leftover_stored.sort_by(|a, b| (a.2, a.0).cmp(&(b.2, b.0)));
        leftover_live.sort_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)));

        for ((_, stored_name, stored_shape), (live_name, live_shape)) in
            leftover_stored.into_iter().zip(leftover_live)
        {
            if stored_shape != live_shape {
                return Err(TrainingError::runtime(format!(
                    "cannot match checkpoint tensor '{}' {:?} to any parameter (next candidate '{}' {:?})",
                    stored_name, stored_shape, live_name, live_shape
                )));
            }
            mapping.insert(stored_name.clone(), live_name.clone());
        }

        Ok(mapping)
    }
}

fn strip_wrapper(name: &str) -> &str {
    let mut bare = name;
    while let Some(rest) = bare.strip_prefix(WRAPPER_PREFIX) {
        bare = rest;
    }
    bare
}
