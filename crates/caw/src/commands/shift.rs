//! Shift command - reposition markers across edits without the local service

use libcaw_core::{shift_lines, CawError, EditBlock};
use serde::Serialize;

use crate::cli::Cli;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct ShiftOutput {
    lines: Vec<u32>,
    edits: Vec<EditBlock>,
}

pub fn run(cli: &Cli, lines: &[u32], edits: &[String]) -> Result<(), CawError> {
    let edits = edits
        .iter()
        .map(|s| parse_edit(s))
        .collect::<Result<Vec<_>, _>>()?;
    let shifted = shift_lines(lines, &edits);

    let human = shifted
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    print_human(cli, &human);
    output_success(
        cli,
        ShiftOutput {
            lines: shifted,
            edits,
        },
    );
    Ok(())
}

/// Parse `LINE:LEN:REPLACE_LEN`
fn parse_edit(s: &str) -> Result<EditBlock, CawError> {
    let parts: Vec<&str> = s.split(':').collect();
    let [line, len, replace_len] = parts.as_slice() else {
        return Err(CawError::InvalidArgs(format!(
            "edit '{}' must be LINE:LEN:REPLACE_LEN",
            s
        )));
    };
    let number = |field: &str, name: &str| {
        field.trim().parse::<u32>().map_err(|_| {
            CawError::InvalidArgs(format!("edit '{}': {} is not a line count", s, name))
        })
    };
    Ok(EditBlock::new(
        number(*line, "LINE")?,
        number(*len, "LEN")?,
        number(*replace_len, "REPLACE_LEN")?,
    ))
}
