use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "GPUWATCH_ADDR", default_value = "0.0.0.0:8090")]
    pub listen_addr: String,

    /// Host roster (JSON). `servers.json` files are accepted as-is.
    #[arg(long, env = "GPUWATCH_ROSTER", default_value = "servers.json")]
    pub roster: String,

    #[arg(long, env = "GPUWATCH_CACHE_TTL_SECS")]
    pub cache_ttl_secs: Option<f64>,

    #[arg(long, env = "GPUWATCH_PROBE_TIMEOUT_SECS")]
    pub probe_timeout_secs: Option<f64>,

    #[arg(long, env = "GPUWATCH_CYCLE_DEADLINE_SECS")]
    pub cycle_deadline_secs: Option<f64>,

    #[arg(long, env = "GPUWATCH_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Extra ssh `-o` option, repeatable (e.g. "StrictHostKeyChecking=accept-new").
    #[arg(long = "ssh-option")]
    pub ssh_options: Vec<String>,

    #[arg(long, env = "GPUWATCH_SSH_PROGRAM", default_value = "ssh")]
    pub ssh_program: String,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    /// Apply command-line overrides on top of the roster's settings.
    pub fn apply(&self, settings: &mut gpuwatch_core::Settings) {
        if let Some(v) = self.cache_ttl_secs {
            settings.cache_ttl = v;
        }
        if let Some(v) = self.probe_timeout_secs {
            settings.ssh_timeout = v;
        }
        if let Some(v) = self.cycle_deadline_secs {
            settings.cycle_deadline = v;
        }
        if let Some(v) = self.max_concurrent {
            settings.max_concurrent = v;
        }
    }
}
