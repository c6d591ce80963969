use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("lime {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: lime");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("LIME_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("LIME_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("tcp_schemes: {}", lime_transport::TCP_SCHEMES.join(", "));
    println!("default_port: {}", lime_transport::DEFAULT_PORT);
    println!(
        "max_envelope_buffer: {}",
        lime_frame::DEFAULT_MAX_BUFFER_SIZE
    );

    Ok(SUCCESS)
}
