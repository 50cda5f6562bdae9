//! Print the box tree of a HEIF (or any ISO BMFF) file
use std::env;
use std::fs::File;
use std::io::BufReader;

use zenheif_parse::BoxReader;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <heif-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let f = File::open(path).expect("Failed to open file");
    let mut f = BufReader::new(f);

    println!("Boxes in {path}:");
    for b in BoxReader::new(&mut f) {
        print!("{b}");
    }
}
