use std::process::ExitCode;

fn main() -> ExitCode {
    report_triage_lib::run()
}
