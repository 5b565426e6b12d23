use colored::Colorize;
use crossterm::{
    cursor,
    terminal::{Clear, ClearType},
    ExecutableCommand,
};
use std::io::stderr;

fn indent_with(header: colored::ColoredString, msg: String) {
    let _ = stderr().execute(Clear(ClearType::CurrentLine));
    let _ = stderr().execute(cursor::MoveToColumn(0));

    eprint!("{:>12} ", header);
    for (i, line) in msg.lines().enumerate() {
        if i == 0 {
            eprintln!("{}", line);
        } else {
            eprintln!("{:>12} {}", " ", line);
        }
    }
}

pub fn status(header: &str, msg: String) {
    indent_with(header.green().bold(), msg);
}

/// Overwrites the current line in place rather than appending a new one -
/// used for a live "elapsed Ns" ticker while a long poll (break sequence,
/// IOS boot wait) runs. The next `status`/`warn`/`err`/`success` call clears
/// this line before printing its own.
pub fn cont_status(header: &str, msg: String) {
    let _ = stderr().execute(cursor::MoveToColumn(0));
    let _ = stderr().execute(Clear(ClearType::CurrentLine));
    eprint!("{:>12} {}", header.green().bold(), msg);
    let _ = stderr().execute(cursor::MoveToColumn(0));
}

pub fn warn(msg: String) {
    indent_with("Warning".yellow().bold(), msg);
}

pub fn err(msg: String) {
    indent_with("Error".red().bold(), msg);
}

pub fn hint(msg: String) {
    indent_with("Hint".blue().bold(), msg);
}

pub fn step(n: usize, total: usize, msg: String) {
    indent_with(format!("[{}/{}]", n, total).cyan().bold(), msg);
}

pub fn success(msg: String) {
    indent_with("Done".green().bold(), msg);
}
