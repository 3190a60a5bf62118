use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pier")]
#[command(about = "Browser-facing gateway for scrcpy streams and input over ADB")]
pub struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on (overrides PIER_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,
}
