use std::collections::{HashMap, HashSet};

use anyhow::bail;
use log::{info, warn};
use sprs::CsMat;

use crate::fileformat::{Annotations, ColumnData, CountMatrix};

pub const DEFAULT_BATCH_KEY: &str = "batch";
pub const UNIQUE_NAME_JOIN: &str = "-";


/**
 * Make names unique. The first occurrence of a name keeps it; later ones get
 * "-1", "-2", ... appended, skipping any candidate that is already taken.
 * Already unique input is returned unchanged
 */
pub fn make_unique(names: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(names.len());
    let mut is_dup = vec![false; names.len()];
    for (i, n) in names.iter().enumerate() {
        if !seen.insert(n.as_str()) {
            is_dup[i] = true;
        }
    }
    if !is_dup.contains(&true) {
        return names.to_vec();
    }

    let mut taken: HashSet<String> = names.iter().cloned().collect();
    let mut counter: HashMap<&str, usize> = HashMap::new();
    let mut out = names.to_vec();
    for (i, n) in names.iter().enumerate() {
        if !is_dup[i] {
            continue;
        }
        let cnt = counter.entry(n.as_str()).or_insert(0);
        loop {
            *cnt += 1;
            let candidate = format!("{}{}{}", n, UNIQUE_NAME_JOIN, cnt);
            if !taken.contains(&candidate) {
                taken.insert(candidate.clone());
                out[i] = candidate;
                break;
            }
        }
    }
    out
}


/**
 * Stack cells of several matrices sharing one gene space. Each input comes
 * with the name of the batch it originates from; with a batch key, that name
 * is recorded as a cell annotation
 */
pub fn concat(
    batches: Vec<(String, CountMatrix)>,
    batch_key: Option<&str>
) -> anyhow::Result<CountMatrix> {
    let Some((first_name, first)) = batches.first() else {
        bail!("Nothing to merge");
    };

    for (name, mat) in &batches[1..] {
        if mat.var_names != first.var_names {
            bail!(
                "Batch {} has a different gene set than batch {} ({} vs {} genes). Align genes before merging",
                name, first_name, mat.n_vars(), first.n_vars()
            );
        }
    }

    let obs = merge_obs_annotations(&batches)?;
    let var = merge_var_annotations(&batches);

    let n_obs: usize = batches.iter().map(|(_, m)| m.n_obs()).sum();
    let n_vars = first.n_vars();
    let var_names = first.var_names.clone();

    let mut indptr: Vec<usize> = Vec::with_capacity(n_obs + 1);
    let mut indices: Vec<usize> = Vec::new();
    let mut data: Vec<f64> = Vec::new();
    let mut obs_names: Vec<String> = Vec::with_capacity(n_obs);
    let mut batch_labels: Vec<String> = Vec::with_capacity(n_obs);
    indptr.push(0);
    for (name, mat) in &batches {
        for row in mat.x.outer_iterator() {
            for (col, &v) in row.iter() {
                indices.push(col);
                data.push(v);
            }
            indptr.push(indices.len());
        }
        obs_names.extend(mat.obs_names.iter().cloned());
        batch_labels.extend(std::iter::repeat(name.clone()).take(mat.n_obs()));
    }

    let obs_names = make_unique(&obs_names);
    let renamed = count_renamed(&batches, &obs_names);
    if renamed > 0 {
        info!("Renamed {} cells with duplicate names", renamed);
    }

    let mut merged = CountMatrix {
        x: CsMat::new((n_obs, n_vars), indptr, indices, data),
        obs_names,
        var_names,
        obs,
        var,
    };
    if let Some(key) = batch_key {
        if merged.obs.contains(key) {
            warn!("Overwriting existing cell annotation '{}' with batch names", key);
        }
        merged.set_obs(key, ColumnData::Strings(batch_labels))?;
    }

    info!("Merged {} parts into {} cells x {} genes", batches.len(), merged.n_obs(), merged.n_vars());
    Ok(merged)
}


fn count_renamed(batches: &[(String, CountMatrix)], new_names: &[String]) -> usize {
    batches
        .iter()
        .flat_map(|(_, m)| m.obs_names.iter())
        .zip(new_names.iter())
        .filter(|(a, b)| a != b)
        .count()
}


/// Cell columns kept when present with the same kind everywhere. Order follows the first input
fn merge_obs_annotations(batches: &[(String, CountMatrix)]) -> anyhow::Result<Annotations> {
    let mut out = Annotations::new();
    let Some((_, first)) = batches.first() else {
        return Ok(out);
    };

    for (col_name, first_col) in first.obs.iter() {
        let compatible = batches.iter().all(|(_, m)| {
            m.obs.get(col_name).is_some_and(|c| c.kind() == first_col.kind())
        });
        if !compatible {
            warn!("Cell annotation '{}' is missing or differs in type between batches; dropped", col_name);
            continue;
        }

        let mut merged_col = first_col.clone();
        for (_, m) in &batches[1..] {
            if let Some(col) = m.obs.get(col_name) {
                merged_col.append(col)?;
            }
        }
        out.insert(col_name, merged_col);
    }

    for (name, m) in &batches[1..] {
        for col_name in m.obs.names() {
            if !first.obs.contains(&col_name) {
                warn!("Cell annotation '{}' only present in some batches (e.g. {}); dropped", col_name, name);
            }
        }
    }
    Ok(out)
}


/// Gene columns kept only when identical in every input
fn merge_var_annotations(batches: &[(String, CountMatrix)]) -> Annotations {
    let mut out = Annotations::new();
    let Some((_, first)) = batches.first() else {
        return out;
    };
    for (col_name, first_col) in first.var.iter() {
        if batches.iter().all(|(_, m)| m.var.get(col_name) == Some(first_col)) {
            out.insert(col_name, first_col.clone());
        }
    }
    out
}
