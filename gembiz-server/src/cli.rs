use clap::Parser;

#[derive(Parser)]
#[command(
    name = "gembiz",
    about = "OpenAI/Claude/Gemini-compatible gateway over pooled Gemini Business accounts",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Verbose logging (also saves registration debug artifacts)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Single-pass registration mode
    #[arg(long)]
    pub once: bool,

    /// Auto-subscribe mode for the outbound proxy collaborator
    #[arg(long)]
    pub auto: bool,

    /// Refresh one account with a headful browser and exit. Uses the first
    /// account when no email is given.
    #[arg(long, value_name = "EMAIL", num_args = 0..=1, default_missing_value = "")]
    pub refresh: Option<String>,
}
