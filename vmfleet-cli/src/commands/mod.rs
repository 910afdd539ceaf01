pub mod reset;
pub mod spawn;
pub mod status;

use comfy_table::Table;
use comfy_table::presets::NOTHING;

/// Borderless table with a header row, like `ps` output.
pub(crate) fn plain_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING).set_header(header.to_vec());
    table
}
