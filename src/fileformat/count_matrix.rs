use anyhow::bail;
use sprs::{CsMat, TriMat};


/**
 * One column of per-cell (obs) or per-gene (var) annotation.
 * Categorical columns are decoded into strings when loaded
 */
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Strings(Vec<String>),
    Numeric(Vec<f64>),
    Boolean(Vec<bool>),
}
impl ColumnData {

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Strings(v) => v.len(),
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ColumnData::Strings(_) => "string",
            ColumnData::Numeric(_) => "numeric",
            ColumnData::Boolean(_) => "boolean",
        }
    }

    /// Pick out the given rows, in the given order
    pub fn select(&self, rows: &[usize]) -> ColumnData {
        match self {
            ColumnData::Strings(v) => ColumnData::Strings(rows.iter().map(|&i| v[i].clone()).collect()),
            ColumnData::Numeric(v) => ColumnData::Numeric(rows.iter().map(|&i| v[i]).collect()),
            ColumnData::Boolean(v) => ColumnData::Boolean(rows.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Append the values of another column of the same kind
    pub fn append(&mut self, other: &ColumnData) -> anyhow::Result<()> {
        match (self, other) {
            (ColumnData::Strings(a), ColumnData::Strings(b)) => a.extend(b.iter().cloned()),
            (ColumnData::Numeric(a), ColumnData::Numeric(b)) => a.extend_from_slice(b),
            (ColumnData::Boolean(a), ColumnData::Boolean(b)) => a.extend_from_slice(b),
            (a, b) => bail!("Cannot append a {} column to a {} column", b.kind(), a.kind()),
        }
        Ok(())
    }

    /**
     * Render every value as text. Used to group cells by an arbitrary column,
     * and to compare a column against a sentinel label
     */
    pub fn to_labels(&self) -> Vec<String> {
        match self {
            ColumnData::Strings(v) => v.clone(),
            ColumnData::Numeric(v) => v.iter().map(|x| format!("{}", x)).collect(),
            ColumnData::Boolean(v) => v.iter().map(|x| if *x { "True".to_string() } else { "False".to_string() }).collect(),
        }
    }
}



/**
 * Ordered set of named annotation columns, like a pandas dataframe without its index.
 * Insertion order is kept, as it becomes "column-order" in the h5ad file
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    columns: Vec<(String, ColumnData)>,
}
impl Annotations {

    pub fn new() -> Self {
        Self { columns: Vec::new() }
    }

    /// Add a column, replacing any previous column of the same name in place
    pub fn insert(&mut self, name: &str, data: ColumnData) {
        if let Some(slot) = self.columns.iter_mut().find(|(n, _)| n == name) {
            slot.1 = data;
        } else {
            self.columns.push((name.to_string(), data));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn remove(&mut self, name: &str) -> Option<ColumnData> {
        let pos = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(pos).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnData)> {
        self.columns.iter().map(|(n, d)| (n, d))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn select(&self, rows: &[usize]) -> Annotations {
        Annotations {
            columns: self.columns.iter().map(|(n, d)| (n.clone(), d.select(rows))).collect(),
        }
    }
}



/**
 * Sparse count matrix with cell and gene annotations, aimed at being read from and stored as anndata.
 *
 * rows: cells (observations)
 * cols: features (genes)
 *
 * The matrix is always kept in CSR format, one compressed row per cell
 */
#[derive(Debug, Clone)]
pub struct CountMatrix {
    pub x: CsMat<f64>,
    pub obs_names: Vec<String>,
    pub var_names: Vec<String>,
    pub obs: Annotations,
    pub var: Annotations,
}
impl CountMatrix {

    pub fn new(
        x: CsMat<f64>,
        obs_names: Vec<String>,
        var_names: Vec<String>
    ) -> anyhow::Result<Self> {
        let x = if x.is_csr() { x } else { x.to_csr() };
        if x.rows() != obs_names.len() || x.cols() != var_names.len() {
            bail!(
                "Matrix shape {}x{} does not match {} cell names and {} gene names",
                x.rows(), x.cols(), obs_names.len(), var_names.len()
            );
        }
        Ok(Self {
            x,
            obs_names,
            var_names,
            obs: Annotations::new(),
            var: Annotations::new(),
        })
    }

    /**
     * Build from (cell, gene, count) entries. Entries may come in any order;
     * duplicates are summed
     */
    pub fn from_triplets(
        obs_names: Vec<String>,
        var_names: Vec<String>,
        entries: &[(usize, usize, f64)]
    ) -> anyhow::Result<Self> {
        let mut trimat = TriMat::new((obs_names.len(), var_names.len()));
        for &(cell, gene, cnt) in entries {
            if cell >= obs_names.len() || gene >= var_names.len() {
                bail!("Entry ({},{}) is outside of the matrix", cell, gene);
            }
            trimat.add_triplet(cell, gene, cnt);
        }
        Self::new(trimat.to_csr(), obs_names, var_names)
    }

    pub fn n_obs(&self) -> usize {
        self.obs_names.len()
    }

    pub fn n_vars(&self) -> usize {
        self.var_names.len()
    }

    pub fn set_obs(&mut self, name: &str, data: ColumnData) -> anyhow::Result<()> {
        if data.len() != self.n_obs() {
            bail!("obs column '{}' has {} values but there are {} cells", name, data.len(), self.n_obs());
        }
        self.obs.insert(name, data);
        Ok(())
    }

    pub fn set_var(&mut self, name: &str, data: ColumnData) -> anyhow::Result<()> {
        if data.len() != self.n_vars() {
            bail!("var column '{}' has {} values but there are {} genes", name, data.len(), self.n_vars());
        }
        self.var.insert(name, data);
        Ok(())
    }

    /// Text labels of an obs column, one per cell
    pub fn obs_labels(&self, name: &str) -> anyhow::Result<Vec<String>> {
        match self.obs.get(name) {
            Some(col) => Ok(col.to_labels()),
            None => bail!("Cell annotation '{}' not found. Available: {:?}", name, self.obs.names()),
        }
    }

    /**
     * New matrix holding the given cells, in the given order. Gene space is unchanged
     */
    pub fn select_obs(&self, rows: &[usize]) -> CountMatrix {
        let mut indptr: Vec<usize> = Vec::with_capacity(rows.len() + 1);
        let mut indices: Vec<usize> = Vec::new();
        let mut data: Vec<f64> = Vec::new();
        indptr.push(0);
        for &row in rows {
            if let Some(vec) = self.x.outer_view(row) {
                for (col, &v) in vec.iter() {
                    indices.push(col);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }

        CountMatrix {
            x: CsMat::new((rows.len(), self.n_vars()), indptr, indices, data),
            obs_names: rows.iter().map(|&i| self.obs_names[i].clone()).collect(),
            var_names: self.var_names.clone(),
            obs: self.obs.select(rows),
            var: self.var.clone(),
        }
    }

    /// Keep cells where the mask is true
    pub fn filter_obs(&self, keep: &[bool]) -> anyhow::Result<CountMatrix> {
        if keep.len() != self.n_obs() {
            bail!("Cell mask has {} entries but there are {} cells", keep.len(), self.n_obs());
        }
        Ok(self.select_obs(&mask_to_indices(keep)))
    }

    /// Keep genes where the mask is true. Relative gene order is preserved
    pub fn filter_vars(&self, keep: &[bool]) -> anyhow::Result<CountMatrix> {
        if keep.len() != self.n_vars() {
            bail!("Gene mask has {} entries but there are {} genes", keep.len(), self.n_vars());
        }
        let kept_genes = mask_to_indices(keep);

        //Old column index -> new column index
        let mut new_col: Vec<Option<usize>> = vec![None; self.n_vars()];
        for (new_i, &old_i) in kept_genes.iter().enumerate() {
            new_col[old_i] = Some(new_i);
        }

        let mut indptr: Vec<usize> = Vec::with_capacity(self.n_obs() + 1);
        let mut indices: Vec<usize> = Vec::new();
        let mut data: Vec<f64> = Vec::new();
        indptr.push(0);
        for row in self.x.outer_iterator() {
            for (col, &v) in row.iter() {
                if let Some(c) = new_col[col] {
                    indices.push(c);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }

        Ok(CountMatrix {
            x: CsMat::new((self.n_obs(), kept_genes.len()), indptr, indices, data),
            obs_names: self.obs_names.clone(),
            var_names: kept_genes.iter().map(|&i| self.var_names[i].clone()).collect(),
            obs: self.obs.clone(),
            var: self.var.select(&kept_genes),
        })
    }

    /// Count at a given position; zero if not stored
    pub fn get(&self, cell: usize, gene: usize) -> f64 {
        self.x.get(cell, gene).copied().unwrap_or(0.0)
    }
}


pub fn mask_to_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .map(|(i, _)| i)
        .collect()
}
