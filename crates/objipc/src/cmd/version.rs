use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("objipc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let fields = [
        ("name", "objipc".to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
        ("target_os", std::env::consts::OS.to_string()),
        ("target_arch", std::env::consts::ARCH.to_string()),
        (
            "rustc",
            option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string(),
        ),
        (
            "git_hash",
            option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        ),
        (
            "default_socket",
            objipc_client::DEFAULT_SOCKET_NAME.to_string(),
        ),
        ("features", "cli=true".to_string()),
    ];
    for (key, value) in fields {
        println!("{key}: {value}");
    }

    Ok(SUCCESS)
}
