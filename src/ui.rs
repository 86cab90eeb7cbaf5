use prettytable::{Cell, Row, Table};

use crate::{utils::time::fmt_utc, volume::Volume};

pub fn log_volumes(vols: &[Volume]) {
    if vols.is_empty() {
        tracing::info!("<no volumes>");
        return;
    }

    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Name"),
        Cell::new("Size"),
        Cell::new("Backup"),
        Cell::new("Forget"),
        Cell::new("Policy"),
        Cell::new("Restore"),
        Cell::new("Last backup (UTC)"),
    ]));

    for v in vols {
        let last = if v.timestamp == 0 {
            "<never>".to_string()
        } else {
            fmt_utc(v.timestamp).unwrap_or_else(|_| v.timestamp.to_string())
        };
        table.add_row(Row::new(vec![
            Cell::new(&v.name),
            Cell::new(&v.size),
            Cell::new(&v.backup_schedule),
            Cell::new(&v.forget_schedule),
            Cell::new(&v.forget_policy),
            Cell::new(if v.restore { "yes" } else { "no" }),
            Cell::new(&last),
        ]));
    }

    table.printstd();
}
