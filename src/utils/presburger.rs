//! A small presburger-style basic set: an integer tableau `[A I -b]` over
//! `[x 1]^T = 0`, with a rational-relaxation emptiness test by dual
//! simplex. Each row carries its own denominator so the tableau stays in
//! integers; rows are reduced by their gcd after every pivot.

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub type AffineExpr = Vec<i64>;

#[derive(Clone, Debug)]
pub struct BasicSet {
    tableau: Vec<AffineExpr>,
    denom: Vec<i64>,
}

impl BasicSet {
    pub fn new(tableau: Vec<AffineExpr>) -> BasicSet {
        let denom = vec![1; tableau.len()];
        BasicSet { tableau, denom }
    }

    /// Whether the rational relaxation is empty. Termination follows from
    /// the usual dual-simplex argument on these small systems.
    pub fn empty(&mut self) -> bool {
        loop {
            // Evict the basis variable with the most negative b.
            let mut row = None;
            let mut min = 0;
            for (i, r) in self.tableau.iter().enumerate() {
                let b = *r.last().unwrap();
                if b < min {
                    row = Some(i);
                    min = b;
                }
            }
            // Every b is non-negative: a feasible point exists.
            let Some(row) = row else {
                return false;
            };

            // The entering column must have a negative coefficient in the
            // pivot row (the trailing b column can't be pivoted).
            let width = self.tableau[row].len();
            let col = (0..width - 1).find(|&j| self.tableau[row][j] < 0);
            let Some(col) = col else {
                // No valid pivot: infeasible.
                return true;
            };

            // Pivot. The row's true values are tableau/denom, so the
            // normalization multiplies the denominator by the pivot and
            // everything else by the old denominator.
            let pivot = self.tableau[row][col];
            let d_row = self.denom[row];
            for x in self.tableau[row].iter_mut() {
                *x *= d_row;
            }
            self.denom[row] *= pivot;

            let d_row = self.denom[row];
            for i in 0..self.tableau.len() {
                if i == row {
                    continue;
                }
                // t[i][j] := (t[i][j] * d_row - t[i][col] * t[row][j]),
                // with the denominator scaled to match.
                self.denom[i] *= d_row;
                let factor = self.tableau[i][col];
                for j in 0..width {
                    self.tableau[i][j] =
                        self.tableau[i][j] * d_row - factor * self.tableau[row][j];
                }
            }

            // Reduce each row by its gcd to keep the numbers small.
            for i in 0..self.tableau.len() {
                let mut g = self.denom[i].abs();
                for &x in &self.tableau[i] {
                    g = gcd(g, x);
                    if g == 1 {
                        break;
                    }
                }
                if g > 1 {
                    self.denom[i] /= g;
                    for x in self.tableau[i].iter_mut() {
                        *x /= g;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feasible_point_is_not_empty() {
        // x = 2 with slack: x + s = 2, rows already non-negative.
        let mut set = BasicSet::new(vec![vec![1, 1, 2]]);
        assert!(!set.empty());
    }

    #[test]
    fn contradictory_rows_are_empty() {
        // s = -1 with s >= 0 basis and no negative coefficient to pivot.
        let mut set = BasicSet::new(vec![vec![0, 1, -1]]);
        assert!(set.empty());
    }

    #[test]
    fn pivoting_recovers_feasibility() {
        // -x + s1 = -3 (i.e. x >= 3), x + s2 = 10: feasible after a pivot.
        let mut set = BasicSet::new(vec![vec![-1, 1, 0, -3], vec![1, 0, 1, 10]]);
        assert!(!set.empty());
    }
}
