//! Color constants shared by the spinner/log output across `subscriber`
//! and the CLI commands.

use crossterm::style::Color;
use crossterm::style::SetForegroundColor;

pub const RED: SetForegroundColor = SetForegroundColor(Color::Red);
pub const GREEN: SetForegroundColor = SetForegroundColor(Color::Green);
pub const YELLOW: SetForegroundColor = SetForegroundColor(Color::Yellow);
pub const BLUE: SetForegroundColor = SetForegroundColor(Color::Blue);
pub const MAGENTA: SetForegroundColor = SetForegroundColor(Color::Magenta);
pub const CYAN: SetForegroundColor = SetForegroundColor(Color::Cyan);
pub const GRAY: SetForegroundColor = SetForegroundColor(Color::DarkGrey);
pub const RESET: SetForegroundColor = SetForegroundColor(Color::Reset);
