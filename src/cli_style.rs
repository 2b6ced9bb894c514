//! CLI styling for the dccrn tool

use owo_colors::OwoColorize;

use crate::config::ModelDims;
use crate::stack::{StageKind, StageSpec};

/// Check if terminal supports colors
pub fn supports_color() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}

/// Get the ASCII art banner
pub fn get_banner() -> &'static str {
    r#"
     ██████   ██████  ██████ ██████  ███    ██
     ██   ██ ██      ██      ██   ██ ████   ██
     ██   ██ ██      ██      ██████  ██ ██  ██
     ██   ██ ██      ██      ██   ██ ██  ██ ██
     ██████   ██████  ██████ ██   ██ ██   ████

          Complex Convolutional Speech Enhancement
"#
}

/// Print the banner with gradient colors
pub fn print_banner() {
    let banner = get_banner();

    if supports_color() {
        for (i, line) in banner.lines().enumerate() {
            match i % 4 {
                0 => println!("{}", line.bright_blue()),
                1 => println!("{}", line.blue()),
                2 => println!("{}", line.cyan()),
                _ => println!("{}", line.bright_cyan()),
            }
        }
    } else {
        println!("{}", banner);
    }
}

/// Print a styled box with title
pub fn print_box(title: &str, content: &[(&str, String)]) {
    let width: usize = 60;
    let title_width = title.len() + 4;
    let padding = width.saturating_sub(title_width) / 2;

    println!("╔{}╗", "═".repeat(width));
    if supports_color() {
        println!("║{}{}", " ".repeat(padding), title.bright_cyan().bold());
    } else {
        println!("║{}{}", " ".repeat(padding), title);
    }
    println!("╠{}╣", "═".repeat(width));

    for (label, value) in content {
        let plain = format!("  {}: {}", label, value);
        let spaces = width.saturating_sub(plain.chars().count());
        if supports_color() {
            println!("║  {}: {}{}║", label.bright_blue(), value, " ".repeat(spaces));
        } else {
            println!("║{}{}║", plain, " ".repeat(spaces));
        }
    }

    println!("╚{}╝", "═".repeat(width));
}

/// Print a section header between two rules
pub fn print_section(title: &str) {
    let rule = "━".repeat(60);
    println!();
    if supports_color() {
        println!(
            "{}\n  {}\n{}",
            rule.bright_black(),
            title.bright_cyan().bold(),
            rule.bright_black()
        );
    } else {
        println!("{}\n  {}\n{}", rule, title, rule);
    }
}

/// Kind of one-line status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Warning,
    Info,
}

impl Status {
    /// Glyph shown on color terminals
    pub fn glyph(self) -> &'static str {
        match self {
            Self::Success => "✓",
            Self::Error => "✗",
            Self::Warning => "⚠",
            Self::Info => "ℹ",
        }
    }

    /// Prefix used when colors are unavailable
    pub fn tag(self) -> &'static str {
        match self {
            Self::Success => "[OK]",
            Self::Error => "[ERR]",
            Self::Warning => "[WARN]",
            Self::Info => "[INFO]",
        }
    }
}

/// Format a status line, plain or colored
pub fn format_status(status: Status, message: &str, color: bool) -> String {
    if !color {
        return format!("{} {}", status.tag(), message);
    }
    let glyph = status.glyph();
    match status {
        Status::Success => format!("{} {}", glyph.bright_green().bold(), message.green()),
        Status::Error => format!("{} {}", glyph.bright_red().bold(), message.red()),
        Status::Warning => format!("{} {}", glyph.bright_yellow().bold(), message.yellow()),
        Status::Info => format!("{} {}", glyph.bright_blue().bold(), message.bright_white()),
    }
}

/// Print a status line; errors go to stderr
pub fn print_status(status: Status, message: &str) {
    let line = format_status(status, message, supports_color());
    match status {
        Status::Error => eprintln!("{}", line),
        _ => println!("{}", line),
    }
}

pub fn print_success(message: &str) {
    print_status(Status::Success, message);
}

pub fn print_error(message: &str) {
    print_status(Status::Error, message);
}

pub fn print_warning(message: &str) {
    print_status(Status::Warning, message);
}

pub fn print_info(message: &str) {
    print_status(Status::Info, message);
}

/// Print device status
pub fn print_device_status(name: &str, available: bool) {
    match (available, supports_color()) {
        (true, true) => println!(
            "  {} {} {}",
            "✓".bright_green().bold(),
            name.bright_green(),
            "(available)".green()
        ),
        (true, false) => println!("  [OK] {} (available)", name),
        (false, true) => println!(
            "  {} {} {}",
            "✗".bright_red(),
            name.bright_black(),
            "(not available)".bright_black()
        ),
        (false, false) => println!("  [  ] {} (not available)", name),
    }
}

/// One line of the stage plan, e.g. `enc 0   1 -> 64   F 257 -> 129   norm+elu`
pub fn format_stage(spec: &StageSpec, freq_in: usize, freq_out: usize) -> String {
    let kind = match spec.kind {
        StageKind::Down => "enc",
        StageKind::Up => "dec",
    };
    let post = match (spec.normalized, spec.activated) {
        (true, true) => "norm+elu",
        (true, false) => "norm",
        (false, true) => "elu",
        (false, false) => "-",
    };
    format!(
        "{} {:<2} {:>5} -> {:<5} F {:>4} -> {:<4} {}",
        kind, spec.index, spec.in_channels, spec.out_channels, freq_in, freq_out, post
    )
}

/// Print the encoder/decoder stage plan
pub fn print_stage_table(dims: &ModelDims) {
    print_section("Stage Plan");
    let mut freq = dims.frequency_bins;
    for (spec, &out) in dims.encoder.iter().zip(&dims.encoder_frequencies) {
        println!("  {}", format_stage(spec, freq, out));
        freq = out;
    }
    let line = format!(
        "lstm   {} -> {} per step",
        dims.recurrent_input, dims.recurrent_output
    );
    if supports_color() {
        println!("  {}", line.bright_magenta());
    } else {
        println!("  {}", line);
    }
    // Decoder stages grow back towards the encoder's input sizes.
    let targets = std::iter::once(dims.frequency_bins)
        .chain(dims.encoder_frequencies.iter().copied())
        .collect::<Vec<_>>();
    for (i, spec) in dims.decoder.iter().enumerate() {
        let out = targets[dims.decoder.len() - 1 - i];
        println!("  {}", format_stage(spec, freq, out));
        freq = out;
    }
}

/// Print usage examples
pub fn print_usage_examples() {
    let examples = [
        (
            "dccrn init --output ./model --hidden-width 32",
            "Write a randomly initialized model",
        ),
        (
            "dccrn inspect --model-path ./model",
            "Show configuration and stage plan",
        ),
        (
            "dccrn enhance -i noisy.npy -o clean.npy --model-path ./model",
            "Enhance a [batch, freq, time, 2] spectrogram",
        ),
        (
            "dccrn enhance -i noisy.npy -o clean.npy --chunk-frames 64",
            "Stream in chunks, carrying recurrent state",
        ),
        ("dccrn devices", "List compute devices"),
    ];

    println!();
    if supports_color() {
        println!("{}", "Usage Examples".bright_cyan().bold());
        println!("{}", "──────────────".bright_black());
    } else {
        println!("Usage Examples");
        println!("──────────────");
    }
    println!();
    for (command, description) in examples {
        if supports_color() {
            println!("  {} {}", "▶".bright_green(), command.bright_white());
            println!("    {} {}", "→".bright_black(), description.bright_black());
        } else {
            println!("  {}", command);
            println!("    {}", description);
        }
        println!();
    }
}
