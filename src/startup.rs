// Startup banner printed before the server begins serving.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner and effective configuration.
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}claude-bridge{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Anthropic Messages gateway -> OpenAI Responses API{RESET}");
    println!();
    println!("  {DIM}Upstream model:{RESET} {}", config.model);
    println!("  {DIM}Upstream URL:{RESET}   {}", config.base_url);
    if config.log_events {
        println!(
            "  {DIM}Event log:{RESET}      {GREEN}on{RESET} {DIM}({}){RESET}",
            config.log_dir.display()
        );
    } else {
        println!("  {DIM}Event log:{RESET}      {DIM}off{RESET}");
    }
    match config.request_timeout {
        Some(limit) => println!(
            "  {DIM}Request timeout:{RESET} {}ms",
            limit.as_millis()
        ),
        None => println!("  {DIM}Request timeout:{RESET} {DIM}none{RESET}"),
    }
    println!();
    println!(
        "  {MAGENTA}▸{RESET} Listening on {BOLD}0.0.0.0:{}{RESET}",
        config.port
    );
    println!();
}
