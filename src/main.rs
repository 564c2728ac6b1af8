use std::path::Path;
use std::process::ExitCode;

use raw_tls_handshake::config::HandshakeConfig;
use raw_tls_handshake::core::observability;
use raw_tls_handshake::logging::{self, LogLevel};
use raw_tls_handshake::session::HandshakeSession;

const USAGE: &str = "usage: raw-tls-handshake <host[:port]> | --config <file.json>";

fn load_config(args: &[String]) -> Result<HandshakeConfig, String> {
    match args {
        [flag, path] if flag == "--config" => HandshakeConfig::from_file(Path::new(path)).map_err(|e| e.to_string()),
        [target] if !target.starts_with('-') => {
            let (host, port) = match target.rsplit_once(':') {
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| format!("invalid port '{}'", port))?),
                None => (target.as_str(), 443),
            };
            let config = HandshakeConfig::rsa_aes128_gcm(host, port);
            config.validate().map_err(|e| e.to_string())?;
            Ok(config)
        }
        _ => Err(USAGE.to_string()),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        }
    };
    logging::set_log_level(config.log_level);

    let result = HandshakeSession::connect(&config);
    let counters = observability::snapshot();
    match result {
        Ok(outcome) => {
            println!("Negotiated {} (0x{:04x})", outcome.cipher_suite_name, outcome.cipher_suite);
            println!("Server certificate: {} (chain of {})", outcome.leaf_subject, outcome.chain_len);
            if let Some(params) = &outcome.ecdhe_params {
                println!(
                    "ECDHE parameters: curve 0x{:04x}, {}-byte public key, not used",
                    params.named_curve,
                    params.public_key.len()
                );
            }
            if outcome.key_material.is_some() {
                println!("Finished messages verified; session keys derived");
            }
            raw_tls_handshake::log!(LogLevel::Debug, "{:?}", counters);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            raw_tls_handshake::log!(LogLevel::Debug, "{:?}", counters);
            ExitCode::FAILURE
        }
    }
}
