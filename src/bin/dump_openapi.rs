use std::fs;

fn main() -> anyhow::Result<()> {
    let doc = anon_session::docs::build_openapi(8000)?;
    let s = serde_json::to_string_pretty(&doc)?;

    // Print to stdout unless a target file is given.
    match std::env::args().nth(1) {
        Some(path) => {
            fs::write(&path, s)?;
            eprintln!("wrote {}", path);
        }
        None => println!("{s}"),
    }
    Ok(())
}
