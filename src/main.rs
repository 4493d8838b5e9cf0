fn main() {
    if let Err(e) = routeforge::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
