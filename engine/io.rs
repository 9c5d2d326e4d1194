// ========================================================================================
//
//                           Allele profile input & matrix output
//
// ========================================================================================
//
// Profiles are delimited text tables as written by chewBBACA and read by pHierCC:
// a header row naming the loci, then one row per sample whose first field is the
// sample identifier. Gzip-compressed files are detected by their `.gz` suffix.

use crate::shared::DistanceMatrix;
use csv::{ReaderBuilder, WriterBuilder};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};
use ndarray::Array2;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// chewBBACA marks alleles inferred during the current run with this prefix.
const INFERRED_PREFIX: &str = "INF-";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed delimited text in '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("profile '{path}' has no locus columns")]
    NoLoci { path: String },
    #[error("profile '{path}' contains no samples")]
    NoSamples { path: String },
    #[error("allele table of '{path}' is inconsistent: {source}")]
    Shape {
        path: String,
        #[source]
        source: ndarray::ShapeError,
    },
    #[error("output file '{path}' already exists; remove or rename it before running")]
    OutputExists { path: String },
    #[error("{ids} sample ids were given for a matrix of {samples} samples")]
    SampleCountMismatch { ids: usize, samples: usize },
}

/// A parsed allele profile with the identifier column split off.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileTable {
    pub sample_ids: Vec<String>,
    pub loci: Vec<String>,
    /// `samples x loci`, 0 where no allele was called.
    pub alleles: Array2<u32>,
}

impl ProfileTable {
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_loci(&self) -> usize {
        self.loci.len()
    }
}

/// Interprets one allele cell. Anything that is not a non-negative integer,
/// optionally carrying the inferred-allele prefix, counts as "no call".
pub fn parse_allele(token: &str) -> Option<u32> {
    let token = token.trim();
    let digits = token.strip_prefix(INFERRED_PREFIX).unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>, ProfileError> {
    let file = File::open(path).map_err(|source| ProfileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads an allele profile table.
pub fn read_profiles(path: &Path, delimiter: u8) -> Result<ProfileTable, ProfileError> {
    let display = path.display().to_string();
    let csv_err = |source| ProfileError::Csv {
        path: display.clone(),
        source,
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(open_maybe_gzip(path)?);

    let loci: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect();
    if loci.is_empty() {
        return Err(ProfileError::NoLoci { path: display });
    }

    let mut sample_ids = Vec::new();
    let mut cells = Vec::new();
    let mut uncalled_tokens = 0usize;
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let mut fields = record.iter();
        sample_ids.push(fields.next().unwrap_or_default().to_string());
        for field in fields {
            match parse_allele(field) {
                Some(allele) => cells.push(allele),
                None => {
                    let trimmed = field.trim();
                    if !(trimmed.is_empty() || trimmed == "-") {
                        uncalled_tokens += 1;
                    }
                    cells.push(0);
                }
            }
        }
    }
    if sample_ids.is_empty() {
        return Err(ProfileError::NoSamples { path: display });
    }
    if uncalled_tokens > 0 {
        warn!("Treated {uncalled_tokens} non-numeric allele tokens in '{display}' as missing");
    }

    let alleles = Array2::from_shape_vec((sample_ids.len(), loci.len()), cells).map_err(
        |source| ProfileError::Shape {
            path: display.clone(),
            source,
        },
    )?;
    info!(
        "Loaded {} samples x {} loci from '{display}'",
        sample_ids.len(),
        loci.len()
    );
    Ok(ProfileTable {
        sample_ids,
        loci,
        alleles,
    })
}

/// Writes the computed rows of `dist` as a delimited table: a `#sample` header
/// naming every sample, then one line per computed row. Cells on or above the
/// diagonal are left empty. A `.gz` suffix selects gzip compression.
///
/// Refuses to overwrite an existing file.
pub fn write_distance_matrix(
    path: &Path,
    sample_ids: &[String],
    dist: &DistanceMatrix,
    delimiter: u8,
) -> Result<(), ProfileError> {
    let display = path.display().to_string();
    if sample_ids.len() != dist.n_samples() {
        return Err(ProfileError::SampleCountMismatch {
            ids: sample_ids.len(),
            samples: dist.n_samples(),
        });
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| match source.kind() {
            io::ErrorKind::AlreadyExists => ProfileError::OutputExists {
                path: display.clone(),
            },
            _ => ProfileError::Io {
                path: display.clone(),
                source,
            },
        })?;
    let buffered = BufWriter::new(file);
    let io_err = |source| ProfileError::Io {
        path: display.clone(),
        source,
    };
    let buffered = if path.extension().is_some_and(|ext| ext == "gz") {
        let encoder = write_rows(
            GzEncoder::new(buffered, Compression::default()),
            sample_ids,
            dist,
            delimiter,
            &display,
        )?;
        // The gzip trailer is only written by `finish`.
        encoder.finish().map_err(io_err)?
    } else {
        write_rows(buffered, sample_ids, dist, delimiter, &display)?
    };
    buffered
        .into_inner()
        .map_err(|e| io_err(e.into_error()))?;
    Ok(())
}

/// Streams the header and every computed row into `sink`, handing the sink back
/// flushed so the caller can finish whatever encoding wraps the file.
fn write_rows<W: Write>(
    sink: W,
    sample_ids: &[String],
    dist: &DistanceMatrix,
    delimiter: u8,
    display: &str,
) -> Result<W, ProfileError> {
    let csv_err = |source| ProfileError::Csv {
        path: display.to_string(),
        source,
    };
    let mut writer = WriterBuilder::new().delimiter(delimiter).from_writer(sink);

    writer
        .write_record(std::iter::once("#sample").chain(sample_ids.iter().map(String::as_str)))
        .map_err(csv_err)?;

    let view = dist.view();
    let mut record: Vec<String> = Vec::with_capacity(sample_ids.len() + 1);
    for (r, row) in view.outer_iter().enumerate() {
        let i = dist.start() + r;
        record.clear();
        record.push(sample_ids[i].clone());
        record.extend(
            row.iter()
                .enumerate()
                .map(|(j, d)| if j < i { d.to_string() } else { String::new() }),
        );
        writer.write_record(&record).map_err(csv_err)?;
    }

    writer.into_inner().map_err(|e| ProfileError::Io {
        path: display.to_string(),
        source: e.into_error(),
    })
}
