fn main() {
    let exit_code = match majak::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("majak: error: {}", err);
            1
        }
    };
    std::process::exit(exit_code);
}
