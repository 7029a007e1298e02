use clap::Parser;

/// APsystems ECU proxy - decodes ECU telemetry while relaying it to the cloud
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Decode only; never relay frames to the upstream collector
    #[clap(long = "no-forward")]
    pub no_forward: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
