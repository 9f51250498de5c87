fn main() {
    if let Err(err) = pihub_lib::run() {
        eprintln!("pihub: {err:#}");
        std::process::exit(1);
    }
}
