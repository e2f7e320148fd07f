use clap::Parser;
use log::{error, info};
use mirador::configuration::config::Config;
use mirador::controller::Controller;
use mirador::proxy::CertificateAuthority;
use std::path::Path;

#[derive(Parser)]
#[command(name = "mirador")]
#[command(version = "0.0.2")]
#[command(about = "Dynamic analysis orchestrator for mobile applications")]
struct Args {
    config_file: String,

    /// Generate the root CA at the configured paths and exit
    #[arg(long)]
    generate_ca: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
            mirador v0.0.2 - dynamic analysis orchestrator
==============================================================================
"
    );

    let args = Args::parse();

    if args.config_file.is_empty() {
        error!("No configuration file found");
        std::process::exit(1);
    }

    info!("Importing configuration");
    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration imported successfully");

    if args.generate_ca {
        let proxy = config.proxy_config();
        let root = &proxy.root_certificate;
        if let Err(e) =
            CertificateAuthority::generate("mirador root CA", &root.cert_path, &root.key_path)
        {
            error!("Unable to generate the root CA: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    let result = tokio::spawn(async move {
        info!("Spawning the controller");
        controller.run().await
    });

    match result.await {
        Ok(Ok(())) => info!("Controller stopped"),
        Ok(Err(e)) => {
            error!("Error occured in the controller process: {}, exiting...", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Error joining at the end of execution: {:?}", e);
            std::process::exit(1);
        }
    }
}
