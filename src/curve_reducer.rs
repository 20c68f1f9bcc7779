//! Ramer–Douglas–Peucker simplification of a position-over-time polyline.
//!
//! Points are treated as `(time in seconds, position)`. Distances and the
//! tolerance are compared squared so the inner loop never takes a root.

use std::time::Duration;

/// A position at a point in time, measured from some pipeline reference.
/// Equality is structural: two points are the same only if both the
/// position and the time match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokerPoint {
    /// 0.0 to 1.0.
    pub position: f64,
    /// Time since the reference.
    pub time: Duration,
}

impl StrokerPoint {
    #[allow(missing_docs)]
    pub fn new(position: f64, time: Duration) -> Self {
        Self { position, time }
    }

    fn xy(&self) -> (f64, f64) {
        (self.time.as_secs_f64(), self.position)
    }
}

/// Squared perpendicular distance of `p` from the line through `a` and `b`.
/// A zero-length chord falls back to the squared distance from `a`.
fn distance_sq(p: &StrokerPoint, a: &StrokerPoint, b: &StrokerPoint) -> f64 {
    let (px, py) = p.xy();
    let (ax, ay) = a.xy();
    let (bx, by) = b.xy();
    let (dx, dy) = (bx - ax, by - ay);
    let chord_sq = dx * dx + dy * dy;
    if chord_sq == 0.0 {
        return (px - ax).powi(2) + (py - ay).powi(2);
    }
    let cross = dx * (py - ay) - dy * (px - ax);
    cross * cross / chord_sq
}

/// Simplify `points` so that no dropped point lies further than `epsilon`
/// from the result. The first and last points always survive, and the
/// result is a subsequence of the input.
///
/// Fewer than three points, or an `epsilon` that is not finite or not
/// meaningfully positive, returns the input unchanged.
pub fn reduce(points: &[StrokerPoint], epsilon: f64) -> Vec<StrokerPoint> {
    if points.len() < 3 || !epsilon.is_finite() || epsilon <= f64::EPSILON {
        return points.to_vec();
    }

    // Leading copies of the last point would give the outer chord zero length.
    let mut start = 0;
    while points.len() - start > 1 && points[start] == points[points.len() - 1] {
        start += 1;
    }

    let mut reduced = points[..start].to_vec();
    let rest = &points[start..];
    if rest.len() < 3 {
        reduced.extend_from_slice(rest);
    } else {
        reduced.extend(simplify(rest, epsilon * epsilon));
    }
    reduced
}

fn simplify(points: &[StrokerPoint], epsilon_sq: f64) -> Vec<StrokerPoint> {
    let first = points[0];
    let last = points[points.len() - 1];

    let mut index = 0;
    let mut dmax = 0.0;
    for (i, p) in points.iter().enumerate().take(points.len() - 1).skip(1) {
        let d = distance_sq(p, &first, &last);
        if d > dmax {
            index = i;
            dmax = d;
        }
    }

    if dmax > epsilon_sq {
        let mut left = simplify(&points[..=index], epsilon_sq);
        left.pop();
        left.extend(simplify(&points[index..], epsilon_sq));
        left
    } else {
        vec![first, last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(values: &[(u64, f64)]) -> Vec<StrokerPoint> {
        values
            .iter()
            .map(|&(ms, p)| StrokerPoint::new(p, Duration::from_millis(ms)))
            .collect()
    }

    fn is_subsequence(sub: &[StrokerPoint], of: &[StrokerPoint]) -> bool {
        let mut it = of.iter();
        sub.iter().all(|p| it.any(|q| q == p))
    }

    /// Largest distance of any input point from the reduced polyline
    /// segment spanning its time.
    fn max_deviation(input: &[StrokerPoint], reduced: &[StrokerPoint]) -> f64 {
        input
            .iter()
            .map(|p| {
                let seg = reduced
                    .windows(2)
                    .find(|w| w[0].time <= p.time && p.time <= w[1].time)
                    .unwrap();
                distance_sq(p, &seg[0], &seg[1]).sqrt()
            })
            .fold(0.0, f64::max)
    }

    #[test]
    fn non_positive_or_bad_epsilon_is_identity() {
        let input = pts(&[(0, 0.0), (10, 0.5), (20, 0.0), (30, 0.5)]);
        for eps in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::EPSILON / 2.0] {
            assert_eq!(reduce(&input, eps), input);
        }
    }

    #[test]
    fn short_input_is_identity() {
        let input = pts(&[(0, 0.0), (10, 1.0)]);
        assert_eq!(reduce(&input, 0.1), input);
        assert!(reduce(&[], 0.1).is_empty());
    }

    #[test]
    fn straight_line_collapses_to_endpoints() {
        let input: Vec<_> = (0..20)
            .map(|i| StrokerPoint::new(i as f64 * 0.01, Duration::from_millis(i * 100)))
            .collect();
        let reduced = reduce(&input, 0.001);
        assert_eq!(reduced, vec![input[0], input[19]]);
    }

    #[test]
    fn peaks_survive() {
        let input = pts(&[
            (0, 0.1),
            (100, 0.4),
            (200, 0.9),
            (300, 0.5),
            (400, 0.1),
            (500, 0.12),
        ]);
        let reduced = reduce(&input, 0.05);
        assert!(reduced.contains(&input[2]));
        assert_eq!(reduced.first(), input.first());
        assert_eq!(reduced.last(), input.last());
    }

    #[test]
    fn output_is_bounded_subsequence() {
        let input: Vec<_> = (0..200)
            .map(|i| {
                let t = i as f64 * 0.02;
                let p = 0.5 + 0.4 * (t * 3.0).sin() + 0.03 * (t * 37.0).cos();
                StrokerPoint::new(p, Duration::from_millis(i * 20))
            })
            .collect();
        for eps in [0.01, 0.05, 0.2] {
            let reduced = reduce(&input, eps);
            assert!(reduced.len() < input.len());
            assert!(is_subsequence(&reduced, &input));
            assert_eq!(reduced.first(), input.first());
            assert_eq!(reduced.last(), input.last());
            assert!(max_deviation(&input, &reduced) <= eps + 1e-9);
        }
    }

    #[test]
    fn leading_duplicates_of_the_last_point_are_kept() {
        let a = StrokerPoint::new(0.3, Duration::from_millis(5));
        let reduced = reduce(&[a, a, a, a], 0.1);
        assert_eq!(reduced, vec![a, a, a, a]);
    }
}
