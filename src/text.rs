use std::fs;
use std::io;
use std::io::prelude::*;
use std::path;

use crate::region::{Region, RegionId};

fn invalid_data<E: Into<Box<dyn std::error::Error + Send + Sync>>>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Read a region from whitespace separated `energy cps [background]` rows.
///
/// Blank lines and lines starting with `#` are skipped. The background column is
/// either present on every row or on none of them.
pub fn read_region<R: BufRead>(reader: R, id: RegionId) -> io::Result<Region> {
    let mut energy = Vec::new();
    let mut cps = Vec::new();
    let mut background = Vec::new();
    let mut ncols = None;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(|tok| tok.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid_data(format!("line {}: {e}", lineno + 1)))?;
        if !(2..=3).contains(&values.len()) {
            return Err(invalid_data(format!(
                "line {}: expected 2 or 3 columns, found {}",
                lineno + 1,
                values.len()
            )));
        }
        match ncols {
            None => ncols = Some(values.len()),
            Some(n) if n != values.len() => {
                return Err(invalid_data(format!(
                    "line {}: expected {n} columns, found {}",
                    lineno + 1,
                    values.len()
                )))
            }
            Some(_) => {}
        }
        energy.push(values[0]);
        cps.push(values[1]);
        if let Some(b) = values.get(2) {
            background.push(*b);
        }
    }

    let region = Region::new(id, energy, cps).map_err(invalid_data)?;
    if ncols == Some(3) {
        region.with_background(background).map_err(invalid_data)
    } else {
        Ok(region)
    }
}

pub fn load_region<P: AsRef<path::Path>>(path: P, id: RegionId) -> io::Result<Region> {
    let file = fs::File::open(path)?;
    read_region(io::BufReader::new(file), id)
}

/// Write `energy cps background fit` rows, tab separated
pub fn write_region<W: Write>(mut writer: W, region: &Region, fit: &[f64]) -> io::Result<()> {
    if fit.len() != region.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "fit has {} points but the region has {}",
                fit.len(),
                region.len()
            ),
        ));
    }
    writeln!(writer, "# energy\tcps\tbackground\tfit")?;
    for (((e, c), b), f) in region
        .energy
        .iter()
        .zip(region.cps.iter())
        .zip(region.background.iter())
        .zip(fit.iter())
    {
        writeln!(writer, "{e}\t{c}\t{b}\t{f}")?;
    }
    writer.flush()
}

pub fn to_file<P: AsRef<path::Path>>(region: &Region, fit: &[f64], path: P) -> io::Result<()> {
    let file = fs::File::create(path)?;
    write_region(io::BufWriter::new(file), region, fit)
}
