//! Host-side helpers for picking the next token.

/// Next-token probabilities for one logits row.
///
/// Non-finite logits get probability zero. A row without any finite logit maps to
/// all zeros.
#[must_use]
pub fn probabilities(logits: &[f32]) -> Vec<f32> {
    let Some(peak) = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .reduce(f32::max)
    else {
        return vec![0.0; logits.len()];
    };

    let weights: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - peak).exp() } else { 0.0 })
        .collect();
    // The peak contributes exp(0) = 1, so the total is at least 1.
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Token id with the highest finite score; the earliest id wins a tie.
///
/// Returns 0 when no score is finite.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn most_likely(scores: &[f32]) -> u32 {
    scores
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (id, &v)| match best {
            Some((_, top)) if top >= v => best,
            _ => Some((id, v)),
        })
        .map_or(0, |(id, _)| id as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probabilities_are_normalised_and_ordered() {
        let probs = probabilities(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn non_finite_logits_get_zero_mass() {
        let probs = probabilities(&[f32::NEG_INFINITY, 0.0, f32::NAN]);
        assert_eq!(probs, vec![0.0, 1.0, 0.0]);
        assert_eq!(probabilities(&[f32::NEG_INFINITY; 3]), vec![0.0; 3]);
    }

    #[test]
    fn most_likely_picks_peak() {
        assert_eq!(most_likely(&[0.0, 1.0, 0.5]), 1);
        assert_eq!(most_likely(&[f32::NAN, -3.0, f32::INFINITY]), 1);
    }

    #[test]
    fn ties_go_to_earliest_id() {
        assert_eq!(most_likely(&[0.2, 0.4, 0.4, 0.1]), 1);
        assert_eq!(most_likely(&[0.25; 4]), 0);
        assert_eq!(most_likely(&[]), 0);
    }
}
