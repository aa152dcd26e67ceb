//! Human-readable table rendering for `list`/`volumes list`/`packages list`.
//!
//! Generalizes the teacher's own list-table builder (`tabular::{Table, Row}`
//! with one column per field of interest), swapping its cell coloring for
//! `crossterm`'s `SetForegroundColor` (`ansi.rs`) — `tabular`'s `ansi-cell`
//! feature already accounts for escape codes when measuring column widths,
//! so the two compose without a separate width-stripping step.

use tabular::{Row, Table};

use crate::ansi::{GRAY, GREEN, RESET, YELLOW};
use crate::orchestrator::{Worktree, WorktreeState};

fn colored_state(state: WorktreeState) -> String {
    let color = match state {
        WorktreeState::Running => GREEN,
        WorktreeState::Stopped => YELLOW,
        WorktreeState::Created | WorktreeState::Absent => GRAY,
        WorktreeState::Error => crate::ansi::RED,
    };
    format!("{color}{state:?}{RESET}")
}

pub fn worktrees(worktrees: &[Worktree]) -> Table {
    let mut table = Table::new("{:<}  {:<}  {:<}  {:<}");
    table.add_row(
        Row::new()
            .with_cell("BRANCH")
            .with_cell("STATE")
            .with_cell("STACK")
            .with_cell("CREATED"),
    );
    for w in worktrees {
        table.add_row(
            Row::new()
                .with_cell(&w.branch)
                .with_cell(colored_state(w.state))
                .with_cell(&w.stack_name)
                .with_cell(w.created_at.as_deref().unwrap_or("-")),
        );
    }
    table
}

pub fn volume_sizes(rows: &[(String, String)]) -> Table {
    let mut table = Table::new("{:<}  {:<}");
    table.add_row(Row::new().with_cell("VOLUME").with_cell("SIZE"));
    for (volume, size) in rows {
        table.add_row(Row::new().with_cell(volume).with_cell(size));
    }
    table
}

pub fn packages(rows: &[(String, String, String)]) -> Table {
    let mut table = Table::new("{:<}  {:<}  {:<}");
    table.add_row(Row::new().with_cell("PATH").with_cell("BRANCH").with_cell("CREATED"));
    for (path, branch, created_at) in rows {
        table.add_row(Row::new().with_cell(path).with_cell(branch).with_cell(created_at));
    }
    table
}
