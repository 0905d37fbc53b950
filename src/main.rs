fn main() -> std::process::ExitCode {
    pharmassist_lib::run()
}
