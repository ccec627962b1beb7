use std::fs;

use nvtcp_qpair::QueuePairConfig;

use crate::cmd::{ConfigArgs, RoleArg};
use crate::exit::{io_error, qpair_error, CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

pub fn run(args: ConfigArgs, format: OutputFormat) -> CliResult<i32> {
    let config = match &args.path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
            QueuePairConfig::from_json(&json)
                .map_err(|err| qpair_error(&format!("{} is invalid", path.display()), err))?
        }
        None => match args.role {
            RoleArg::Host => QueuePairConfig::host("host"),
            RoleArg::Controller => QueuePairConfig::controller("controller"),
        },
    };

    if !args.validate {
        print_record(&config, format);
    }
    Ok(SUCCESS)
}
