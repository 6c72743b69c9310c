//! Spherical k-means for IVF training.
//!
//! All stored vectors are unit-norm, so assignment uses the dot product and
//! centroids are re-normalized after every update (spherical variant).

use rand::seq::index::sample;
use rand::Rng;

/// Dot product of two equal-length slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Indices of the `n` centroids nearest to `vector`, best first.
pub fn nearest_centroids(vector: &[f32], centroids: &[f32], dim: usize, n: usize) -> Vec<usize> {
    let k = centroids.len() / dim;
    let mut scored: Vec<(usize, f32)> = (0..k)
        .map(|c| (c, dot(vector, &centroids[c * dim..(c + 1) * dim])))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(n.min(k)).map(|(c, _)| c).collect()
}

/// Lloyd iterations over unit vectors. `rows` indexes into `data`
/// (`dim`-strided); returns `k * dim` normalized centroids.
pub fn train(data: &[f32], dim: usize, rows: &[usize], k: usize, iters: usize, rng: &mut impl Rng) -> Vec<f32> {
    let k = k.min(rows.len()).max(1);

    // Initialize from k distinct data points.
    let mut centroids = Vec::with_capacity(k * dim);
    for pick in sample(rng, rows.len(), k) {
        let row = rows[pick];
        centroids.extend_from_slice(&data[row * dim..(row + 1) * dim]);
    }

    let mut assignment = vec![0usize; rows.len()];
    for _ in 0..iters {
        // Assign.
        for (i, &row) in rows.iter().enumerate() {
            let v = &data[row * dim..(row + 1) * dim];
            assignment[i] = nearest_centroids(v, &centroids, dim, 1)[0];
        }

        // Update.
        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for (i, &row) in rows.iter().enumerate() {
            let c = assignment[i];
            counts[c] += 1;
            let v = &data[row * dim..(row + 1) * dim];
            for (s, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(v) {
                *s += x;
            }
        }
        for c in 0..k {
            let target = &mut sums[c * dim..(c + 1) * dim];
            if counts[c] == 0 {
                // Empty cluster: reseed from a random data point.
                let row = rows[rng.gen_range(0..rows.len())];
                target.copy_from_slice(&data[row * dim..(row + 1) * dim]);
            }
            normalize(target);
        }
        centroids = sums;
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_unit(dim: usize, rng: &mut impl Rng) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        normalize(&mut v);
        v
    }

    #[test]
    fn centroids_are_unit_norm() {
        let mut rng = StdRng::seed_from_u64(7);
        let dim = 16;
        let data: Vec<f32> = (0..50).flat_map(|_| random_unit(dim, &mut rng)).collect();
        let rows: Vec<usize> = (0..50).collect();

        let centroids = train(&data, dim, &rows, 8, 5, &mut rng);
        assert_eq!(centroids.len(), 8 * dim);
        for c in 0..8 {
            let norm = l2_norm(&centroids[c * dim..(c + 1) * dim]);
            assert!((norm - 1.0).abs() < 1e-3, "centroid {c} norm {norm}");
        }
    }

    #[test]
    fn recovers_planted_clusters() {
        let mut rng = StdRng::seed_from_u64(11);
        let dim = 8;
        // Two well-separated anchors with small perturbations.
        let mut anchor_a = vec![0.0; dim];
        anchor_a[0] = 1.0;
        let mut anchor_b = vec![0.0; dim];
        anchor_b[1] = 1.0;

        let mut data = Vec::new();
        for i in 0..40 {
            let anchor = if i % 2 == 0 { &anchor_a } else { &anchor_b };
            let mut v: Vec<f32> = anchor
                .iter()
                .map(|x| x + rng.gen_range(-0.05..0.05))
                .collect();
            normalize(&mut v);
            data.extend(v);
        }
        let rows: Vec<usize> = (0..40).collect();
        let centroids = train(&data, dim, &rows, 2, 10, &mut rng);

        // Points from the same anchor land in the same list.
        let c0 = nearest_centroids(&data[0..dim], &centroids, dim, 1)[0];
        let c2 = nearest_centroids(&data[2 * dim..3 * dim], &centroids, dim, 1)[0];
        let c1 = nearest_centroids(&data[dim..2 * dim], &centroids, dim, 1)[0];
        assert_eq!(c0, c2);
        assert_ne!(c0, c1);
    }
}
