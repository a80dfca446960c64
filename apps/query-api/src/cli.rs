use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "query-api", about = "Irrigation telemetry read API")]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Print the OpenAPI document and exit.
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
