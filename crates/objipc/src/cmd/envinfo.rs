use std::collections::BTreeMap;

use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct PlatformInfo {
    os: String,
    arch: String,
}

#[derive(Serialize)]
struct EnvInfoOutput {
    version: String,
    rust_version: String,
    git_hash: String,
    platform: PlatformInfo,
    environment: BTreeMap<String, Option<String>>,
    resolved_socket: Option<String>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let mut env = BTreeMap::new();
    for var in [
        objipc_client::SOCKET_ENV,
        objipc_client::RUNTIME_DIR_ENV,
        objipc_client::FD_ENV,
        objipc_client::DEBUG_ENV,
        "OBJIPC_LOG_LEVEL",
        "RUST_LOG",
    ] {
        env.insert(var.to_string(), std::env::var(var).ok());
    }

    let resolved_socket = resolved_socket_path(&env);

    let output = EnvInfoOutput {
        version: env!("CARGO_PKG_VERSION").to_string(),
        rust_version: option_env!("RUSTC_VERSION")
            .unwrap_or("unknown")
            .to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        platform: PlatformInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        environment: env,
        resolved_socket,
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

/// Mirror the runtime's socket discovery without connecting.
fn resolved_socket_path(env: &BTreeMap<String, Option<String>>) -> Option<String> {
    if env
        .get(objipc_client::FD_ENV)
        .and_then(|v| v.as_deref())
        .is_some()
    {
        return Some("<inherited descriptor>".to_string());
    }
    let name = env
        .get(objipc_client::SOCKET_ENV)
        .and_then(|v| v.clone())
        .unwrap_or_else(|| objipc_client::DEFAULT_SOCKET_NAME.to_string());
    if name.starts_with('/') {
        return Some(name);
    }
    env.get(objipc_client::RUNTIME_DIR_ENV)
        .and_then(|v| v.as_deref())
        .map(|dir| format!("{dir}/{name}"))
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Pretty => {
            println!("objipc environment\n");
            println!("  Version:    {}", output.version);
            println!("  Rust:       {}", output.rust_version);
            println!("  Git hash:   {}", output.git_hash);
            println!(
                "  Platform:   {} ({})",
                output.platform.os, output.platform.arch
            );
            println!(
                "  Socket:     {}",
                output.resolved_socket.as_deref().unwrap_or("(unresolved)")
            );
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<18} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_socket_name_wins() {
        let mut env = BTreeMap::new();
        env.insert(
            objipc_client::SOCKET_ENV.to_string(),
            Some("/run/custom.sock".to_string()),
        );
        env.insert(
            objipc_client::RUNTIME_DIR_ENV.to_string(),
            Some("/run/user/1000".to_string()),
        );
        assert_eq!(
            resolved_socket_path(&env).as_deref(),
            Some("/run/custom.sock")
        );
    }

    #[test]
    fn relative_name_joins_runtime_dir() {
        let mut env = BTreeMap::new();
        env.insert(
            objipc_client::RUNTIME_DIR_ENV.to_string(),
            Some("/run/user/1000".to_string()),
        );
        assert_eq!(
            resolved_socket_path(&env).as_deref(),
            Some("/run/user/1000/objipc-0")
        );
    }

    #[test]
    fn inherited_descriptor_short_circuits() {
        let mut env = BTreeMap::new();
        env.insert(objipc_client::FD_ENV.to_string(), Some("5".to_string()));
        assert_eq!(
            resolved_socket_path(&env).as_deref(),
            Some("<inherited descriptor>")
        );
    }

    #[test]
    fn unresolvable_without_runtime_dir() {
        let env = BTreeMap::new();
        assert_eq!(resolved_socket_path(&env), None);
    }
}
