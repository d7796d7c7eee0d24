fn main() -> std::process::ExitCode {
    tensortune_lib::run()
}
