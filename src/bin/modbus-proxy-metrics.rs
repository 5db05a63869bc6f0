// ABOUTME: On-demand CLI front-end for the log metrics scanner
// ABOUTME: Prints the aggregated JSON summary to stdout; never writes to the log file

use argh::FromArgs;

#[derive(FromArgs)]
/// Scan the proxy log file and print time-bucketed anomaly counts and rtt percentiles.
struct Args {
    /// path to the proxy log file
    #[argh(option, default = "String::from(\"/var/log/modbus_proxy.log\")")]
    log_file: String,

    /// window length in minutes for the returned time series
    #[argh(option, default = "60")]
    window_minutes: i64,

    /// maximum number of trailing bytes to scan
    #[argh(option, default = "10 * 1024 * 1024")]
    max_scan_bytes: u64,
}

fn main() -> std::process::ExitCode {
    let args: Args = argh::from_env();

    match modbus_proxy::metrics::scan(&args.log_file, args.window_minutes, args.max_scan_bytes) {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => {
                    println!("{json}");
                    std::process::ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("failed to serialize metrics report: {e}");
                    std::process::ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("failed to scan {}: {e}", args.log_file);
            std::process::ExitCode::FAILURE
        }
    }
}
