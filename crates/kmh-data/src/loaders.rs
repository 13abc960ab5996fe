use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kmh_types::{DataError, DistanceMatrix, KmhError, KmhResult};

use crate::points::PointMatrix;

/// Field separator of an instance file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Byte(u8),
    /// Any run of spaces or tabs.
    Whitespace,
}

/// One (delimiter, decimal separator) convention to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCandidate {
    pub delimiter: Delimiter,
    pub decimal: char,
}

impl FormatCandidate {
    pub const fn new(delimiter: Delimiter, decimal: char) -> Self {
        Self { delimiter, decimal }
    }
}

impl fmt::Display for FormatCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delimiter {
            Delimiter::Byte(b) => write!(f, "sep='{}' decimal='{}'", b as char, self.decimal),
            Delimiter::Whitespace => write!(f, "sep=whitespace decimal='{}'", self.decimal),
        }
    }
}

/// Conventions tried in order; the first one yielding a usable table wins.
pub const DEFAULT_CANDIDATES: [FormatCandidate; 5] = [
    FormatCandidate::new(Delimiter::Byte(b';'), ','),
    FormatCandidate::new(Delimiter::Byte(b','), '.'),
    FormatCandidate::new(Delimiter::Whitespace, '.'),
    FormatCandidate::new(Delimiter::Byte(b';'), '.'),
    FormatCandidate::new(Delimiter::Byte(b','), ','),
];

/// A loaded problem instance. Immutable once built.
#[derive(Debug, Clone)]
pub struct Instance {
    pub path: PathBuf,
    /// File name including extension.
    pub file: String,
    pub stem: String,
    pub format: FormatCandidate,
    pub raw: PointMatrix,
    pub standardized: PointMatrix,
    pub distances: Arc<DistanceMatrix>,
}

impl Instance {
    pub fn n(&self) -> usize {
        self.distances.len()
    }
}

/// Reads point files of unknown layout and turns them into distance matrices.
#[derive(Debug, Clone)]
pub struct InstanceLoader {
    candidates: Vec<FormatCandidate>,
    max_points: Option<usize>,
}

impl InstanceLoader {
    pub fn new() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.to_vec(),
            max_points: None,
        }
    }

    /// Keep only the first `limit` data rows of each file.
    pub fn with_max_points(mut self, limit: Option<usize>) -> Self {
        self.max_points = limit;
        self
    }

    /// Load, standardize and build the distance matrix of one instance file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Instance, DataError> {
        let path = path.as_ref();
        let (raw, format) = self.read_points(path)?;
        let standardized = raw.standardized();
        let distances = standardized.distance_matrix()?;

        let file = file_name(path);
        let stem = instance_stem(path);
        tracing::info!(
            "Loaded instance {}: n={} d={} ({})",
            file,
            raw.n_points(),
            raw.dims(),
            format
        );

        Ok(Instance {
            path: path.to_path_buf(),
            file,
            stem,
            format,
            raw,
            standardized,
            distances: Arc::new(distances),
        })
    }

    /// Parse the raw point table, trying every candidate format in order.
    pub fn read_points(&self, path: &Path) -> Result<(PointMatrix, FormatCandidate), DataError> {
        if !path.is_file() {
            return Err(DataError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path).map_err(|_| DataError::NotFound {
            path: path.to_path_buf(),
        })?;
        let text = strip_comments(&String::from_utf8_lossy(&bytes));

        for candidate in &self.candidates {
            match self.parse_with(&text, *candidate) {
                Some(rows) if rows.len() >= 2 && rows[0].len() >= 2 => {
                    let points = PointMatrix::from_rows(rows)?;
                    return Ok((points, *candidate));
                }
                Some(rows) => {
                    tracing::debug!(
                        "{}: {} gave {} usable rows, trying next format",
                        path.display(),
                        candidate,
                        rows.len()
                    );
                }
                None => {
                    tracing::debug!("{}: {} could not be parsed", path.display(), candidate);
                }
            }
        }

        Err(DataError::Unreadable {
            path: path.to_path_buf(),
            attempted: self
                .candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Parse `text` under one convention. Returns the fully numeric rows.
    fn parse_with(&self, text: &str, candidate: FormatCandidate) -> Option<Vec<Vec<f64>>> {
        let records: Vec<Vec<String>> = match candidate.delimiter {
            Delimiter::Byte(sep) => {
                let mut rdr = csv::ReaderBuilder::new()
                    .delimiter(sep)
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(text.as_bytes());
                let mut records = Vec::new();
                for (line, result) in rdr.records().enumerate() {
                    match result {
                        Ok(record) => records.push(record.iter().map(str::to_string).collect()),
                        Err(e) => {
                            tracing::debug!("Skipping malformed record {}: {}", line + 1, e);
                        }
                    }
                }
                records
            }
            Delimiter::Whitespace => text
                .lines()
                .map(|l| l.split_whitespace().map(str::to_string).collect())
                .collect(),
        };

        let mut width = None;
        let mut taken = 0usize;
        let mut rows = Vec::new();
        for fields in records {
            if fields.is_empty() || (fields.len() == 1 && fields[0].is_empty()) {
                continue;
            }
            let expected = *width.get_or_insert(fields.len());
            if fields.len() != expected {
                continue;
            }
            if self.max_points.is_some_and(|limit| taken >= limit) {
                break;
            }
            taken += 1;

            let parsed: Option<Vec<f64>> = fields
                .iter()
                .map(|cell| parse_cell(cell, candidate.decimal))
                .collect();
            if let Some(row) = parsed {
                rows.push(row);
            }
        }

        width.map(|_| rows)
    }
}

impl Default for InstanceLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop everything after a `#` on each line, then blank lines.
fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Coerce one cell to a number; anything else counts as missing.
fn parse_cell(cell: &str, decimal: char) -> Option<f64> {
    let cell = cell.trim();
    let value = match cell.parse::<f64>() {
        Ok(v) => v,
        Err(_) if decimal != '.' && cell.matches(decimal).count() == 1 => {
            cell.replace(decimal, ".").parse::<f64>().ok()?
        }
        Err(_) => return None,
    };
    value.is_finite().then_some(value)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("UNKNOWN")
        .to_string()
}

/// File name without its instance extension (`foo.i` -> `foo`).
pub fn instance_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("UNKNOWN")
        .to_string()
}

/// List instance files in `dir` whose extension matches one of
/// `extensions` (case-insensitive), sorted by file name.
pub fn discover_instances(dir: &Path, extensions: &[String]) -> KmhResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
        if matches {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(KmhError::Config(format!(
            "no instances found in {} (extensions: {})",
            dir.display(),
            extensions.join(", ")
        )));
    }

    files.sort_by_key(|p| file_name(p));
    Ok(files)
}
