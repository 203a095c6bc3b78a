fn main() {
    std::process::exit(wordstream::run::cli_main());
}
