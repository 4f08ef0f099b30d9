use std::path::Path;

use anyhow::{anyhow, bail, Context};
use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File as H5File, Group};
use log::{debug, warn};
use sprs::CsMat;

use super::count_matrix::{Annotations, ColumnData, CountMatrix};

// how to use: https://docs.rs/crate/hdf5/latest
// most active fork: https://github.com/metno/hdf5-rust
// hdf5-metno

// file format
// https://anndata.readthedocs.io/en/latest/fileformat-prose.html


/**
 * Read an anndata file. X may be stored as csr_matrix, csc_matrix or a dense array.
 * Cell and gene annotations are read from obs and var; columns that cannot be
 * interpreted are skipped with a warning
 */
pub fn read_h5ad(p: &Path) -> anyhow::Result<CountMatrix> {
    let file = H5File::open(p)
        .with_context(|| format!("Could not open h5ad file {}", p.display()))?;

    let x = read_x(&file)
        .with_context(|| format!("Could not read count matrix X from {}", p.display()))?;
    let (n_rows, n_cols) = (x.rows(), x.cols());

    let (obs_names, obs) = read_dataframe(&file, "obs", n_rows)
        .with_context(|| format!("Could not read obs from {}", p.display()))?;
    let (var_names, var) = read_dataframe(&file, "var", n_cols)
        .with_context(|| format!("Could not read var from {}", p.display()))?;

    let mut mat = CountMatrix::new(x, obs_names, var_names)?;
    mat.obs = obs;
    mat.var = var;

    debug!("Loaded {} with {} cells and {} genes", p.display(), n_rows, n_cols);
    Ok(mat)
}



/**
 * Store as anndata object. An existing file is replaced
 */
pub fn write_h5ad(mat: &CountMatrix, p: &Path) -> anyhow::Result<()> {

    //Delete output file if it exists already; HDF5 library complains otherwise
    if p.exists() {
        std::fs::remove_file(p)
            .with_context(|| format!("Failed to delete previous output file {}", p.display()))?;
    }

    let file = H5File::create(p)
        .with_context(|| format!("Could not create h5ad file {}", p.display()))?;

    create_str_attr(&file, "encoding-type", "anndata")?;
    create_str_attr(&file, "encoding-version", "0.1.0")?;

    write_x(&file, &mat.x)?;
    write_dataframe(&file, "obs", &mat.obs_names, &mat.obs)?;
    write_dataframe(&file, "var", &mat.var_names, &mat.var)?;

    //Empty containers, so that anndata readers find the full layout
    for name in ["layers", "obsm", "obsp", "varm", "varp", "uns"] {
        let group = file.create_group(name)?;
        create_str_attr(&group, "encoding-type", "dict")?;
        create_str_attr(&group, "encoding-version", "0.1.0")?;
    }

    Ok(())
}



////////////////
/// Read X into a CSR matrix
fn read_x(file: &H5File) -> anyhow::Result<CsMat<f64>> {

    //Dense layout: X is a 2d dataset
    if let Ok(ds) = file.dataset("X") {
        let arr = ds.read_2d::<f64>()?;
        let (n_rows, n_cols) = arr.dim();
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in arr.rows() {
            for (col, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(col);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }
        return Ok(CsMat::new((n_rows, n_cols), indptr, indices, data));
    }

    let group = file.group("X")?;
    let encoding = read_str_attr(&group, "encoding-type");

    let data: Vec<f64> = group.dataset("data")?.read_raw::<f64>()?;
    let indices: Vec<usize> = read_index_array(&group.dataset("indices")?)?;
    let indptr: Vec<usize> = read_index_array(&group.dataset("indptr")?)?;

    //Shape is an attribute in the anndata format, but older writers stored it as a dataset
    let shape: Option<Vec<i64>> = if let Ok(attr) = group.attr("shape") {
        Some(attr.read_raw::<i64>()?)
    } else if let Ok(ds) = group.dataset("shape") {
        Some(ds.read_raw::<i64>()?)
    } else {
        None
    };

    let n_outer = indptr.len().saturating_sub(1);
    let max_inner = indices.iter().max().map_or(0, |m| m + 1);

    match encoding.as_deref() {
        Some("csr_matrix") | None => {
            let n_cols = match &shape {
                Some(s) if s.len() == 2 => s[1] as usize,
                _ => max_inner,
            };
            let (indices, data) = check_compressed(n_outer, n_cols, &indptr, indices, data)?;
            Ok(CsMat::new((n_outer, n_cols), indptr, indices, data))
        }
        Some("csc_matrix") => {
            let n_rows = match &shape {
                Some(s) if s.len() == 2 => s[0] as usize,
                _ => max_inner,
            };
            let (indices, data) = check_compressed(n_outer, n_rows, &indptr, indices, data)?;
            let csc = CsMat::new_csc((n_rows, n_outer), indptr, indices, data);
            Ok(csc.to_csr())
        }
        Some(other) => bail!("Unsupported encoding of X: {}", other),
    }
}


/**
 * Validate a compressed sparse structure, and sort the inner indices of each
 * outer slice if the writer did not. sprs refuses unsorted structures
 */
fn check_compressed(
    n_outer: usize,
    n_inner: usize,
    indptr: &[usize],
    mut indices: Vec<usize>,
    mut data: Vec<f64>
) -> anyhow::Result<(Vec<usize>, Vec<f64>)> {
    if indices.len() != data.len() {
        bail!("Sparse matrix has {} indices but {} values", indices.len(), data.len());
    }
    if indptr.first().copied().unwrap_or(0) != 0 || indptr.last().copied().unwrap_or(0) != indices.len() {
        bail!("Sparse matrix indptr does not span the data");
    }
    if indptr.len() != n_outer + 1 {
        bail!("Sparse matrix indptr has the wrong length");
    }
    if indptr.iter().any(|&p| p > indices.len()) {
        bail!("Sparse matrix indptr points past the data");
    }
    if indptr.windows(2).any(|w| w[0] > w[1]) {
        bail!("Sparse matrix indptr is not monotonic");
    }

    for w in indptr.windows(2) {
        let (start, end) = (w[0], w[1]);
        let slice = &indices[start..end];
        if slice.iter().any(|&i| i >= n_inner) {
            bail!("Sparse matrix index out of bounds");
        }
        if !slice.windows(2).all(|p| p[0] < p[1]) {
            let mut pairs: Vec<(usize, f64)> = slice.iter().copied().zip(data[start..end].iter().copied()).collect();
            pairs.sort_by_key(|(i, _)| *i);
            if pairs.windows(2).any(|p| p[0].0 == p[1].0) {
                bail!("Sparse matrix has duplicate entries");
            }
            for (k, (i, v)) in pairs.into_iter().enumerate() {
                indices[start + k] = i;
                data[start + k] = v;
            }
        }
    }
    Ok((indices, data))
}


fn read_index_array(ds: &Dataset) -> anyhow::Result<Vec<usize>> {
    let raw = ds.read_raw::<i64>()?;
    raw.into_iter()
        .map(|v| usize::try_from(v).map_err(|_| anyhow!("Negative index in sparse matrix")))
        .collect()
}


////////////////
/// Store the sparse matrix as X
fn write_x(file: &H5File, x: &CsMat<f64>) -> anyhow::Result<()> {

    // V         = [ 10 20 30 40 50 60 70 80 ]
    // COL_INDEX = [  0  1  1  3  2  3  4  5 ]
    // ROW_INDEX = [  0  2  4  7  8 ]

    let group = file.create_group("X")?;
    create_str_attr(&group, "encoding-type", "csr_matrix")?;
    create_str_attr(&group, "encoding-version", "0.1.0")?;

    let shape: Vec<i64> = vec![x.rows() as i64, x.cols() as i64];
    group.new_attr_builder()
        .with_data(shape.as_slice())
        .create("shape")?;

    let mat_data: &[f64] = x.data();
    let mat_indices: Vec<i64> = x.indices().iter().map(|&i| i as i64).collect();
    let indptr = x.indptr();
    let raw_indptr = indptr.raw_storage();
    let offset = raw_indptr.first().copied().unwrap_or(0);
    let mat_indptr: Vec<i64> = raw_indptr.iter().map(|&p| (p - offset) as i64).collect();

    group.new_dataset_builder().with_data(mat_data).create("data")?;
    group.new_dataset_builder().with_data(mat_indices.as_slice()).create("indices")?;
    group.new_dataset_builder().with_data(mat_indptr.as_slice()).create("indptr")?;
    Ok(())
}



////////////////
/// Read an obs or var dataframe. Returns the index (names) and the columns
fn read_dataframe(
    file: &H5File,
    name: &str,
    expected_len: usize
) -> anyhow::Result<(Vec<String>, Annotations)> {

    //No dataframe: make up names like anndata does
    if !file.link_exists(name) {
        return Ok(((0..expected_len).map(|i| i.to_string()).collect(), Annotations::new()));
    }

    let group = file.group(name)?;
    let index_key = read_str_attr(&group, "_index").unwrap_or_else(|| "_index".to_string());
    let names = read_strings(&group.dataset(&index_key)?)
        .with_context(|| format!("Could not read {}/{}", name, index_key))?;
    if names.len() != expected_len {
        bail!("{} has {} names but the matrix has {} entries on this axis", name, names.len(), expected_len);
    }

    //Prefer the declared column order, otherwise whatever the group holds
    let column_names: Vec<String> = match group.attr("column-order").and_then(|a| a.read_raw::<VarLenUnicode>()) {
        Ok(order) => order.iter().map(|s| s.as_str().to_string()).collect(),
        Err(_) => group
            .member_names()?
            .into_iter()
            .filter(|n| *n != index_key && n != "__categories")
            .collect(),
    };

    let mut annotations = Annotations::new();
    for col in column_names {
        match read_column(&group, &col) {
            Ok(data) if data.len() == expected_len => annotations.insert(&col, data),
            Ok(data) => warn!("Skipping {}/{}: {} values, expected {}", name, col, data.len(), expected_len),
            Err(e) => warn!("Skipping {}/{}: {}", name, col, e),
        }
    }
    Ok((names, annotations))
}


/**
 * Read one dataframe column. Handles plain arrays, categoricals stored as a
 * group (anndata >= 0.8), categoricals with a __categories sibling (anndata 0.7),
 * and nullable integer/boolean arrays
 */
fn read_column(group: &Group, name: &str) -> anyhow::Result<ColumnData> {

    //Old-style categorical
    if group.link_exists("__categories") {
        let cat_group = group.group("__categories")?;
        if cat_group.link_exists(name) {
            let codes = group.dataset(name)?.read_raw::<i64>()?;
            let categories = read_labels(&cat_group.dataset(name)?)?;
            return decode_categorical(&codes, &categories);
        }
    }

    if let Ok(sub) = group.group(name) {
        let encoding = read_str_attr(&sub, "encoding-type").unwrap_or_default();
        return match encoding.as_str() {
            "categorical" => {
                let codes = sub.dataset("codes")?.read_raw::<i64>()?;
                let categories = read_labels(&sub.dataset("categories")?)?;
                decode_categorical(&codes, &categories)
            }
            "nullable-integer" => Ok(ColumnData::Numeric(sub.dataset("values")?.read_raw::<f64>()?)),
            "nullable-boolean" => Ok(ColumnData::Boolean(sub.dataset("values")?.read_raw::<bool>()?)),
            other => bail!("unsupported column encoding '{}'", other),
        };
    }

    let ds = group.dataset(name)?;
    match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenUnicode | TypeDescriptor::VarLenAscii => Ok(ColumnData::Strings(read_strings(&ds)?)),
        TypeDescriptor::Boolean => Ok(ColumnData::Boolean(ds.read_raw::<bool>()?)),
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) | TypeDescriptor::Float(_) => {
            Ok(ColumnData::Numeric(ds.read_raw::<f64>()?))
        }
        other => bail!("unsupported column type {:?}", other),
    }
}


/// Code -1 is a missing value; it becomes an empty string
fn decode_categorical(codes: &[i64], categories: &[String]) -> anyhow::Result<ColumnData> {
    let mut out = Vec::with_capacity(codes.len());
    for &code in codes {
        if code < 0 {
            out.push(String::new());
        } else if let Some(cat) = categories.get(code as usize) {
            out.push(cat.clone());
        } else {
            bail!("categorical code {} out of range ({} categories)", code, categories.len());
        }
    }
    Ok(ColumnData::Strings(out))
}


/// Categories may be strings or numbers; numbers are rendered as text
fn read_labels(ds: &Dataset) -> anyhow::Result<Vec<String>> {
    match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) | TypeDescriptor::Float(_) => {
            Ok(ColumnData::Numeric(ds.read_raw::<f64>()?).to_labels())
        }
        TypeDescriptor::Boolean => Ok(ColumnData::Boolean(ds.read_raw::<bool>()?).to_labels()),
        _ => read_strings(ds),
    }
}


fn read_strings(ds: &Dataset) -> anyhow::Result<Vec<String>> {
    if let Ok(v) = ds.read_raw::<VarLenUnicode>() {
        return Ok(v.iter().map(|s| s.as_str().to_string()).collect());
    }
    let v = ds.read_raw::<VarLenAscii>()?;
    Ok(v.iter().map(|s| s.as_str().to_string()).collect())
}


////////////////
/// Store a dataframe as a group: index, then one array per column
fn write_dataframe(
    file: &H5File,
    name: &str,
    index: &[String],
    annotations: &Annotations
) -> anyhow::Result<()> {
    let group = file.create_group(name)?;
    create_str_attr(&group, "encoding-type", "dataframe")?;
    create_str_attr(&group, "encoding-version", "0.2.0")?;
    create_str_attr(&group, "_index", "_index")?;

    let column_order = vec_to_h5_string(&annotations.names())?;
    if column_order.is_empty() {
        //anndata itself writes an empty float array here
        let empty: Vec<f64> = Vec::new();
        group.new_attr_builder().with_data(empty.as_slice()).create("column-order")?;
    } else {
        group.new_attr_builder().with_data(column_order.as_slice()).create("column-order")?;
    }

    write_string_array(&group, "_index", index)?;

    for (col_name, data) in annotations.iter() {
        match data {
            ColumnData::Strings(v) => write_string_array(&group, col_name, v)?,
            ColumnData::Numeric(v) => {
                let ds = group.new_dataset_builder().with_data(v.as_slice()).create(col_name.as_str())?;
                create_str_attr(&ds, "encoding-type", "array")?;
                create_str_attr(&ds, "encoding-version", "0.2.0")?;
            }
            ColumnData::Boolean(v) => {
                let ds = group.new_dataset_builder().with_data(v.as_slice()).create(col_name.as_str())?;
                create_str_attr(&ds, "encoding-type", "array")?;
                create_str_attr(&ds, "encoding-version", "0.2.0")?;
            }
        }
    }
    Ok(())
}


fn write_string_array(group: &Group, name: &str, values: &[String]) -> anyhow::Result<()> {
    let list = vec_to_h5_string(values)?;
    let ds = group.new_dataset_builder().with_data(list.as_slice()).create(name)?;
    create_str_attr(&ds, "encoding-type", "string-array")?;
    create_str_attr(&ds, "encoding-version", "0.2.0")?;
    Ok(())
}


fn vec_to_h5_string(list: &[String]) -> anyhow::Result<Vec<VarLenUnicode>> {
    list.iter()
        .map(|f| f.parse::<VarLenUnicode>().map_err(|e| anyhow!("Cannot store '{}' in HDF5: {}", f, e)))
        .collect()
}


/**
 * Works on files, groups and datasets; they all deref to Location
 */
fn create_str_attr(location: &hdf5::Location, name: &str, value: &str) -> anyhow::Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|e| anyhow!("Cannot store attribute '{}': {}", name, e))?;
    let attr = location.new_attr::<VarLenUnicode>().create(name)?;
    attr.write_scalar(&value)?;
    Ok(())
}


fn read_str_attr(location: &hdf5::Location, name: &str) -> Option<String> {
    let attr = location.attr(name).ok()?;
    if let Ok(s) = attr.read_scalar::<VarLenUnicode>() {
        return Some(s.as_str().to_string());
    }
    attr.read_scalar::<VarLenAscii>().ok().map(|s| s.as_str().to_string())
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileformat::count_matrix::ColumnData;

    fn sample_matrix() -> CountMatrix {
        let mut m = CountMatrix::from_triplets(
            vec!["AAAC-1".to_string(), "AAAG-1".to_string()],
            vec!["MT-CO1".to_string(), "GAPDH".to_string(), "ACTB".to_string()],
            &[(0, 0, 3.0), (0, 2, 7.0), (1, 1, 12.0)],
        ).unwrap();
        m.set_obs("Phenotype", ColumnData::Strings(vec!["SZ".into(), "BD".into()])).unwrap();
        m.set_obs("total_counts", ColumnData::Numeric(vec![10.0, 12.0])).unwrap();
        m.set_obs("scrublet_is_doublet", ColumnData::Boolean(vec![false, true])).unwrap();
        m.set_var("mt", ColumnData::Boolean(vec![true, false, false])).unwrap();
        m
    }

    #[test]
    fn write_then_read_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sample.h5ad");
        let m = sample_matrix();
        write_h5ad(&m, &p).unwrap();

        let loaded = read_h5ad(&p).unwrap();
        assert_eq!(loaded.obs_names, m.obs_names);
        assert_eq!(loaded.var_names, m.var_names);
        assert_eq!(loaded.get(0, 0), 3.0);
        assert_eq!(loaded.get(0, 2), 7.0);
        assert_eq!(loaded.get(1, 1), 12.0);
        assert_eq!(loaded.get(1, 0), 0.0);
        assert_eq!(loaded.obs.names(), vec!["Phenotype", "total_counts", "scrublet_is_doublet"]);
        assert_eq!(loaded.obs.get("Phenotype"), m.obs.get("Phenotype"));
        assert_eq!(loaded.obs.get("scrublet_is_doublet"), m.obs.get("scrublet_is_doublet"));
        assert_eq!(loaded.var.get("mt"), m.var.get("mt"));
    }

    #[test]
    fn existing_output_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("twice.h5ad");
        let m = sample_matrix();
        write_h5ad(&m, &p).unwrap();
        let sub = m.filter_obs(&[true, false]).unwrap();
        write_h5ad(&sub, &p).unwrap();
        assert_eq!(read_h5ad(&p).unwrap().n_obs(), 1);
    }

    #[test]
    fn empty_matrix_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("empty.h5ad");
        let m = CountMatrix::from_triplets(Vec::new(), vec!["g".to_string()], &[]).unwrap();
        write_h5ad(&m, &p).unwrap();
        let loaded = read_h5ad(&p).unwrap();
        assert_eq!(loaded.n_obs(), 0);
        assert_eq!(loaded.n_vars(), 1);
    }

    #[test]
    fn categorical_group_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cat.h5ad");
        let m = sample_matrix();
        write_h5ad(&m, &p).unwrap();

        //Add a categorical column the way anndata >= 0.8 stores it
        {
            let file = H5File::open_rw(&p).unwrap();
            let obs = file.group("obs").unwrap();
            let cat = obs.create_group("set_ID").unwrap();
            create_str_attr(&cat, "encoding-type", "categorical").unwrap();
            let codes: Vec<i8> = vec![1, -1];
            cat.new_dataset_builder().with_data(codes.as_slice()).create("codes").unwrap();
            let cats: Vec<i64> = vec![5, 7];
            cat.new_dataset_builder().with_data(cats.as_slice()).create("categories").unwrap();
        }
        //column-order is still the old one, so read the column directly
        let file = H5File::open(&p).unwrap();
        let col = read_column(&file.group("obs").unwrap(), "set_ID").unwrap();
        assert_eq!(col, ColumnData::Strings(vec!["7".to_string(), String::new()]));
    }

    #[test]
    fn unsorted_rows_are_sorted() {
        let (indices, data) = check_compressed(
            1, 3, &[0, 3], vec![2, 0, 1], vec![20.0, 0.5, 10.0]
        ).unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(data, vec![0.5, 10.0, 20.0]);
    }

    #[test]
    fn broken_structure_is_rejected() {
        assert!(check_compressed(1, 3, &[0, 2], vec![0], vec![1.0]).is_err());
        assert!(check_compressed(1, 3, &[0, 1], vec![5], vec![1.0]).is_err());
        assert!(check_compressed(1, 3, &[0, 2], vec![1, 1], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn indptr_jumping_past_the_data_is_rejected() {
        assert!(check_compressed(2, 3, &[0, 5, 2], vec![0, 1], vec![1.0, 2.0]).is_err());
        assert!(check_compressed(2, 3, &[0, 2, 1], vec![0, 1], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn large_and_fractional_counts_are_kept_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("precise.h5ad");
        let m = CountMatrix::from_triplets(
            vec!["c1".to_string()],
            vec!["g1".to_string(), "g2".to_string()],
            &[(0, 0, 16777217.0), (0, 1, 0.1)],
        ).unwrap();
        write_h5ad(&m, &p).unwrap();

        let loaded = read_h5ad(&p).unwrap();
        assert_eq!(loaded.get(0, 0), 16777217.0);
        assert_eq!(loaded.get(0, 1), 0.1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_h5ad(&dir.path().join("nope.h5ad")).is_err());
    }
}
