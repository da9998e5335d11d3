//! Read accuracy from a local alignment of a called sequence to its reference.

/// Scores a predicted sequence against its reference, in percent.
pub trait AccuracyMetric {
    fn score(&self, reference: &str, sequence: &str) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scoring {
    pub matched: i32,
    pub mismatched: i32,
    /// Cost of the first gap position.
    pub gap_open: i32,
    /// Cost of each further gap position.
    pub gap_extend: i32,
}

impl Default for Scoring {
    fn default() -> Self {
        Self {
            matched: 5,
            mismatched: -4,
            gap_open: 8,
            gap_extend: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignmentCounts {
    pub matches: usize,
    pub mismatches: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl AlignmentCounts {
    pub fn columns(&self) -> usize {
        self.matches + self.mismatches + self.insertions + self.deletions
    }

}

/// Smith–Waterman accuracy: `matches / alignment columns * 100`, or 0 when
/// the alignment is shorter than `min_coverage` of the reference length.
/// Coverage counts every alignment column, inserted bases included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentAccuracy {
    pub min_coverage: f64,
    pub scoring: Scoring,
}

impl AlignmentAccuracy {
    pub fn new(min_coverage: f64) -> Self {
        Self {
            min_coverage,
            scoring: Scoring::default(),
        }
    }
}

impl Default for AlignmentAccuracy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl AccuracyMetric for AlignmentAccuracy {
    fn score(&self, reference: &str, sequence: &str) -> f64 {
        if reference.is_empty() || sequence.is_empty() {
            return 0.0;
        }
        let reference: Vec<u8> = reference.bytes().collect();
        let query: Vec<u8> = sequence.bytes().collect();
        let counts = local_align(&query, &reference, self.scoring);

        let coverage = counts.columns() as f64 / reference.len() as f64;
        if coverage < self.min_coverage || counts.columns() == 0 {
            return 0.0;
        }
        counts.matches as f64 / counts.columns() as f64 * 100.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    Start,
    Diagonal,
    Deletion,
    Insertion,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Best,
    Deletion,
    Insertion,
}

/// Affine-gap local alignment of `query` against `reference` with traceback.
pub fn local_align(query: &[u8], reference: &[u8], scoring: Scoring) -> AlignmentCounts {
    let rows = query.len() + 1;
    let cols = reference.len() + 1;
    let neg = i32::MIN / 4;

    let mut best = vec![0i32; cols];
    let mut del = vec![neg; cols];
    let mut ins = vec![neg; cols];

    let mut best_from = vec![Origin::Start; rows * cols];
    let mut del_extends = vec![false; rows * cols];
    let mut ins_extends = vec![false; rows * cols];

    let mut top = (0i32, 0usize, 0usize);

    for i in 1..rows {
        let mut diag = 0i32;
        let mut left_best = 0i32;
        let mut left_del = neg;
        for j in 1..cols {
            let at = i * cols + j;

            let del_open = left_best - scoring.gap_open;
            let del_ext = left_del - scoring.gap_extend;
            let d = del_open.max(del_ext);
            del_extends[at] = del_ext > del_open;

            let ins_open = best[j] - scoring.gap_open;
            let ins_ext = ins[j] - scoring.gap_extend;
            let n = ins_open.max(ins_ext);
            ins_extends[at] = ins_ext > ins_open;

            let substitution = if query[i - 1] == reference[j - 1] {
                scoring.matched
            } else {
                scoring.mismatched
            };
            let m = diag + substitution;

            let (h, origin) = [
                (m, Origin::Diagonal),
                (d, Origin::Deletion),
                (n, Origin::Insertion),
            ]
            .into_iter()
            .fold((0, Origin::Start), |acc, candidate| {
                if candidate.0 > acc.0 {
                    candidate
                } else {
                    acc
                }
            });

            diag = best[j];
            best[j] = h;
            del[j] = d;
            ins[j] = n;
            best_from[at] = origin;
            left_best = h;
            left_del = d;

            if h > top.0 {
                top = (h, i, j);
            }
        }
    }

    let mut counts = AlignmentCounts::default();
    let (_, mut i, mut j) = top;
    let mut state = State::Best;
    while i > 0 && j > 0 {
        let at = i * cols + j;
        match state {
            State::Best => match best_from[at] {
                Origin::Start => break,
                Origin::Diagonal => {
                    if query[i - 1] == reference[j - 1] {
                        counts.matches += 1;
                    } else {
                        counts.mismatches += 1;
                    }
                    i -= 1;
                    j -= 1;
                }
                Origin::Deletion => state = State::Deletion,
                Origin::Insertion => state = State::Insertion,
            },
            State::Deletion => {
                counts.deletions += 1;
                if !del_extends[at] {
                    state = State::Best;
                }
                j -= 1;
            }
            State::Insertion => {
                counts.insertions += 1;
                if !ins_extends[at] {
                    state = State::Best;
                }
                i -= 1;
            }
        }
    }
    counts
}
