//! Seeded stratified train/test splits and k-fold partitions

use crate::error::Error;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Row indices of a train/test partition, both sorted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Indices of `rows` grouped by label and shuffled per class
fn shuffled_classes(rows: &[usize], labels: &[usize], rng: &mut StdRng) -> BTreeMap<usize, Vec<usize>> {
    let mut classes: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &row in rows {
        classes.entry(labels[row]).or_default().push(row);
    }
    for members in classes.values_mut() {
        members.shuffle(rng);
    }
    classes
}

/// Single split preserving each class's share in both partitions
pub fn stratified_split(labels: &[usize], test_fraction: f64, seed: u64) -> crate::Result<Split> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(Error::InvalidConfig(format!(
            "test fraction must be in (0, 1), got {test_fraction}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let rows: Vec<usize> = (0..labels.len()).collect();
    let mut split = Split {
        train: Vec::new(),
        test: Vec::new(),
    };

    for (class, members) in shuffled_classes(&rows, labels, &mut rng) {
        let n = members.len();
        let n_test = if n < 2 {
            0
        } else {
            ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1)
        };
        log::debug!("class {class}: {} train / {n_test} test", n - n_test);
        split.test.extend_from_slice(&members[..n_test]);
        split.train.extend_from_slice(&members[n_test..]);
    }

    if split.test.is_empty() || split.train.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "{} rows are too few for a stratified split",
            labels.len()
        )));
    }

    split.train.sort_unstable();
    split.test.sort_unstable();
    Ok(split)
}

/// `k` stratified folds over `rows`; each fold's test part is disjoint from the others
pub fn stratified_folds(rows: &[usize], labels: &[usize], k: usize, seed: u64) -> crate::Result<Vec<Split>> {
    if k < 2 {
        return Err(Error::InvalidConfig(format!("need at least 2 folds, got {k}")));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut assignment = vec![Vec::new(); k];
    let mut offset = 0;
    for (class, members) in shuffled_classes(rows, labels, &mut rng) {
        if members.len() < k {
            return Err(Error::InvalidConfig(format!(
                "class {class} has {} members, fewer than {k} folds",
                members.len()
            )));
        }
        for (i, row) in members.into_iter().enumerate() {
            assignment[(i + offset) % k].push(row);
        }
        offset += 1;
    }

    Ok((0..k)
        .map(|fold| {
            let mut test = assignment[fold].clone();
            let mut train: Vec<usize> = assignment
                .iter()
                .enumerate()
                .filter(|&(other, _)| other != fold)
                .flat_map(|(_, part)| part.iter().copied())
                .collect();
            test.sort_unstable();
            train.sort_unstable();
            Split { train, test }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(positives: usize, negatives: usize) -> Vec<usize> {
        let mut labels = vec![1; positives];
        labels.extend(vec![0; negatives]);
        labels
    }

    #[test]
    fn test_stratified_split_preserves_ratio() {
        let labels = labels(20, 80);
        let split = stratified_split(&labels, 0.2, 42).unwrap();

        assert_eq!(split.test.len(), 20);
        assert_eq!(split.train.len(), 80);
        assert_eq!(split.test.iter().filter(|&&i| labels[i] == 1).count(), 4);
        assert_eq!(split.train.iter().filter(|&&i| labels[i] == 1).count(), 16);

        let mut all: Vec<usize> = split.train.iter().chain(split.test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_seeded() {
        let labels = labels(30, 70);
        assert_eq!(
            stratified_split(&labels, 0.2, 7).unwrap(),
            stratified_split(&labels, 0.2, 7).unwrap()
        );
        assert_ne!(
            stratified_split(&labels, 0.2, 7).unwrap(),
            stratified_split(&labels, 0.2, 8).unwrap()
        );
    }

    #[test]
    fn test_small_classes_keep_a_test_member() {
        let labels = labels(2, 8);
        let split = stratified_split(&labels, 0.2, 1).unwrap();
        assert_eq!(split.test.iter().filter(|&&i| labels[i] == 1).count(), 1);
    }

    #[test]
    fn test_invalid_fraction() {
        assert!(stratified_split(&labels(5, 5), 0.0, 1).is_err());
        assert!(stratified_split(&labels(5, 5), 1.0, 1).is_err());
        assert!(stratified_split(&[1], 0.2, 1).is_err());
    }

    #[test]
    fn test_folds_partition_rows() {
        let labels = labels(9, 21);
        let rows: Vec<usize> = (0..30).collect();
        let folds = stratified_folds(&rows, &labels, 3, 42).unwrap();
        assert_eq!(folds.len(), 3);

        let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.test.iter().copied()).collect();
        seen.sort_unstable();
        assert_eq!(seen, rows);

        for fold in &folds {
            assert_eq!(fold.train.len() + fold.test.len(), 30);
            assert_eq!(fold.test.iter().filter(|&&i| labels[i] == 1).count(), 3);
            assert!(fold.test.iter().all(|row| !fold.train.contains(row)));
        }
    }

    #[test]
    fn test_folds_on_subset() {
        let labels = labels(10, 10);
        let rows = vec![0, 2, 4, 6, 10, 12, 14, 16];
        let folds = stratified_folds(&rows, &labels, 2, 3).unwrap();
        for fold in &folds {
            assert!(fold.train.iter().chain(fold.test.iter()).all(|r| rows.contains(r)));
        }
        assert!(stratified_folds(&rows, &labels, 5, 3).is_err());
        assert!(stratified_folds(&rows, &labels, 1, 3).is_err());
    }
}
