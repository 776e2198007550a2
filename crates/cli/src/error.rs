use colored::Colorize;

/// Format an error for CLI display with contextual help messages.
pub fn display_error(err: &anyhow::Error) {
    let msg = format!("{err}");

    if msg.contains("unable to open database") || msg.contains("Failed to open sqlite:") {
        eprintln!("  {} Cannot open the optimizer database", "ERROR".red().bold());
        eprintln!(
            "        Has the daemon run at least once? Check: {}",
            "systemctl status spica-optimizer".dimmed()
        );
        eprintln!(
            "        Or point DATABASE_URL at the right file: {}",
            "DATABASE_URL=sqlite:./data/spica_optimizer.db".dimmed()
        );
    } else if msg.contains("signing key unavailable") {
        eprintln!("  {} No signing key configured", "ERROR".red().bold());
        eprintln!(
            "        Set the shared key: {}",
            "SPICA_SIGNING_KEY=<hex or raw key>".dimmed()
        );
    } else {
        eprintln!("  {} {}", "ERROR".red().bold(), msg);
        for cause in err.chain().skip(1) {
            eprintln!("        {} {cause}", "caused by:".dimmed());
        }
    }
}
