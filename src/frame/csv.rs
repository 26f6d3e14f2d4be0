//! CSV export of a frame's cell states.

use std::fmt::Display;
use std::io::{self, Write};

use super::CellState;

const HEADER: &str = "id,position x,position y,position z,\
direction x,direction y,direction z,radius,length,growth_rate,cell_age,\
eff_growth,cell_type,cell_adhesion,target_volume,volume,strain_rate,\
start_volume,species,signals";

fn optional<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn vector(value: Option<[f32; 3]>) -> String {
    value.map_or_else(
        || ",,".to_owned(),
        |[x, y, z]| format!("{x},{y},{z}"),
    )
}

/// Array attributes are space-separated so they stay in one column.
fn list(value: Option<&Vec<f32>>) -> String {
    value
        .map(|v| {
            v.iter().map(f32::to_string).collect::<Vec<_>>().join(" ")
        })
        .unwrap_or_default()
}

/// Write `cells` as CSV with one header row. Absent attributes are empty
/// fields.
pub fn write_states<'a, W: Write>(
    out: &mut W,
    cells: impl IntoIterator<Item = &'a CellState>,
) -> io::Result<()> {
    writeln!(out, "{HEADER}")?;
    for cell in cells {
        let fields = [
            cell.id.to_string(),
            vector(cell.position),
            vector(cell.direction),
            optional(cell.radius),
            optional(cell.length),
            optional(cell.growth_rate),
            optional(cell.cell_age),
            optional(cell.eff_growth),
            optional(cell.cell_type),
            optional(cell.cell_adhesion),
            optional(cell.target_volume),
            optional(cell.volume),
            optional(cell.strain_rate),
            optional(cell.start_volume),
            list(cell.species.as_ref()),
            list(cell.signals.as_ref()),
        ];
        writeln!(out, "{}", fields.join(","))?;
    }
    Ok(())
}
