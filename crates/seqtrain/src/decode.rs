use candle_core::{DType, Tensor, D};

use crate::error::{Result, TrainingError};

/// Maps label ids to symbols, skipping the blank/padding id 0.
pub fn decode_ref(encoded: &[i64], alphabet: &[String]) -> Result<String> {
    let mut out = String::with_capacity(encoded.len());
    for &code in encoded {
        if code <= 0 {
            continue;
        }
        let symbol = alphabet.get(code as usize).ok_or_else(|| {
            TrainingError::runtime(format!(
                "label {} is outside an alphabet of {} symbols",
                code,
                alphabet.len()
            ))
        })?;
        out.push_str(symbol);
    }
    Ok(out)
}

/// Decodes every row of an `[N, L]` target tensor.
pub fn decode_targets(targets: &Tensor, alphabet: &[String]) -> Result<Vec<String>> {
    let rows = targets.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    rows.iter().map(|row| decode_ref(row, alphabet)).collect()
}

/// Drops `pre` leading and `post` trailing symbols.
pub fn trim_context(sequence: &str, pre: usize, post: usize) -> String {
    let total = sequence.chars().count();
    let keep = total.saturating_sub(pre + post);
    sequence.chars().skip(pre).take(keep).collect()
}

/// Argmax path over `[T, C]` scores with repeats collapsed and blanks dropped.
pub fn greedy_ctc_decode(scores: &Tensor, alphabet: &[String]) -> Result<String> {
    let path = scores.argmax(D::Minus1)?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let mut collapsed = Vec::with_capacity(path.len());
    let mut previous = None;
    for label in path {
        if previous != Some(label) {
            collapsed.push(label);
        }
        previous = Some(label);
    }
    decode_ref(&collapsed, alphabet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn alphabet() -> Vec<String> {
        ["N", "A", "C", "G", "T"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn references_skip_padding() {
        assert_eq!(decode_ref(&[1, 2, 0, 4, 0, 0], &alphabet()).unwrap(), "ACT");
        assert!(decode_ref(&[9], &alphabet()).is_err());
    }

    #[test]
    fn target_rows_decode_independently() {
        let targets = Tensor::new(&[[1i64, 1, 3], [4, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(
            decode_targets(&targets, &alphabet()).unwrap(),
            vec!["AAG".to_string(), "T".to_string()]
        );
    }

    #[test]
    fn context_trimming() {
        assert_eq!(trim_context("ACGTACGT", 2, 1), "GTACG");
        assert_eq!(trim_context("ACGT", 0, 0), "ACGT");
        assert_eq!(trim_context("AC", 2, 3), "");
    }

    #[test]
    fn greedy_decode_collapses_repeats() {
        // frames: A A blank A C C
        let scores = Tensor::new(
            &[
                [0f32, 9.0, 0.0, 0.0, 0.0],
                [0.0, 9.0, 0.0, 0.0, 0.0],
                [9.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 9.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 9.0, 0.0, 0.0],
                [0.0, 0.0, 9.0, 0.0, 0.0],
            ],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(greedy_ctc_decode(&scores, &alphabet()).unwrap(), "AAC");
    }
}
