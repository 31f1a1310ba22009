//! SQLite output. Every database holds a single table named `data`, which is
//! replaced wholesale on each write.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::Path;

use crate::frequencies::{AlleleFreq, PopulationFitness};

fn open(path: &Path) -> Result<Connection> {
    Connection::open(path).with_context(|| format!("failed to open {}", path.display()))
}

fn get_usize(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let value: i64 = row.get(idx)?;
    usize::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

pub fn write_allele_frequencies(path: impl AsRef<Path>, rows: &[AlleleFreq]) -> Result<()> {
    let mut conn = open(path.as_ref())?;
    let tx = conn.transaction()?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS data;
         CREATE TABLE data (
             generation INTEGER NOT NULL,
             position REAL NOT NULL,
             origin INTEGER NOT NULL,
             dac INTEGER NOT NULL,
             fixation INTEGER NOT NULL,
             neutral INTEGER NOT NULL,
             label INTEGER NOT NULL,
             esize REAL NOT NULL,
             w REAL
         );",
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO data (generation, position, origin, dac, fixation, neutral, label, esize, w)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for r in rows {
            stmt.execute(params![
                r.generation as i64,
                r.position,
                r.origin as i64,
                r.dac as i64,
                r.fixation,
                r.neutral,
                i64::from(r.label),
                r.esize,
                r.w,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn write_population_fitness(path: impl AsRef<Path>, rows: &[PopulationFitness]) -> Result<()> {
    let mut conn = open(path.as_ref())?;
    let tx = conn.transaction()?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS data;
         CREATE TABLE data (
             generation INTEGER NOT NULL,
             mean_fitness REAL NOT NULL,
             var_fitness REAL NOT NULL
         );",
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO data (generation, mean_fitness, var_fitness) VALUES (?1, ?2, ?3)",
        )?;
        for r in rows {
            stmt.execute(params![r.generation as i64, r.mean_fitness, r.var_fitness])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Rows in insertion order.
pub fn read_allele_frequencies(path: impl AsRef<Path>) -> Result<Vec<AlleleFreq>> {
    let conn = open(path.as_ref())?;
    let mut stmt = conn.prepare(
        "SELECT generation, position, origin, dac, fixation, neutral, label, esize, w
         FROM data ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AlleleFreq {
                generation: get_usize(row, 0)?,
                position: row.get(1)?,
                origin: get_usize(row, 2)?,
                dac: get_usize(row, 3)?,
                fixation: row.get(4)?,
                neutral: row.get(5)?,
                label: row.get(6)?,
                esize: row.get(7)?,
                w: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn read_population_fitness(path: impl AsRef<Path>) -> Result<Vec<PopulationFitness>> {
    let conn = open(path.as_ref())?;
    let mut stmt =
        conn.prepare("SELECT generation, mean_fitness, var_fitness FROM data ORDER BY rowid")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PopulationFitness {
                generation: get_usize(row, 0)?,
                mean_fitness: row.get(1)?,
                var_fitness: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
