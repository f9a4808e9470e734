use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orgtree::{OrgDocument, load, render_document, render_outline};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Org-mode outline tooling built on the orgtree crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print the document model.
    Parse(ParseArgs),

    /// Print a compact heading outline of Org files.
    Outline(InputArgs),

    /// Render Org files back from their parsed form (verbatim round-trip).
    Render(InputArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, verbose),
        Commands::Outline(args) => handle_outline(args, verbose),
        Commands::Render(args) => handle_render(args, verbose),
    }
}

fn handle_parse(args: ParseArgs, verbose: bool) -> Result<()> {
    let parsed = load_all(&args.inputs, verbose)?;

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a OrgDocument,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (index, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{doc:#?}");
            if parsed.len() > 1 && index + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_outline(args: InputArgs, verbose: bool) -> Result<()> {
    let parsed = load_all(&args.inputs, verbose)?;
    for (index, (path, doc)) in parsed.iter().enumerate() {
        if parsed.len() > 1 {
            if index > 0 {
                println!();
            }
            println!("== {} ==", path.display());
        }
        print!("{}", render_outline(doc));
    }
    Ok(())
}

fn handle_render(args: InputArgs, verbose: bool) -> Result<()> {
    let parsed = load_all(&args.inputs, verbose)?;
    for (path, doc) in &parsed {
        if parsed.len() > 1 {
            println!("== {} ==", path.display());
        }
        print!("{}", render_document(doc));
    }
    Ok(())
}

fn load_all(inputs: &[PathBuf], verbose: bool) -> Result<Vec<(PathBuf, OrgDocument)>> {
    let files = gather_org_files(inputs)?;
    if files.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    let mut parsed = Vec::with_capacity(files.len());
    for path in files {
        if verbose {
            eprintln!("Parsing {path:?}");
        }
        let doc = load(&path).with_context(|| format!("parsing {path:?}"))?;
        parsed.push((path, doc));
    }
    Ok(parsed)
}

/// Expand files and directories into a sorted, deduplicated list of `.org`
/// files. Explicitly named files must carry the `.org` extension; directories
/// are walked recursively.
fn gather_org_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        let meta = fs::metadata(input).with_context(|| format!("reading metadata for {input:?}"))?;
        if meta.is_dir() {
            walk_directory(input, &mut out)?;
        } else if is_org_file(input) {
            out.push(input.clone());
        } else {
            anyhow::bail!("{input:?} is not an .org file");
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn walk_directory(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {dir:?}"))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            walk_directory(&path, out)?;
        } else if is_org_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn gather_walks_directories_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("nested");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(tmp.path().join("a.org"), "* A").expect("write a");
        fs::write(nested.join("b.org"), "* B").expect("write b");
        fs::write(nested.join("ignored.txt"), "nope").expect("write txt");

        let found = gather_org_files(&[tmp.path().to_path_buf()]).expect("gather");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| is_org_file(p)));
    }

    #[test]
    fn gather_rejects_non_org_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("notes.txt");
        fs::write(&path, "text").expect("write");

        assert!(gather_org_files(&[path]).is_err());
    }

    #[test]
    fn gather_deduplicates_overlapping_inputs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("a.org");
        fs::write(&file, "* A").expect("write");

        let found =
            gather_org_files(&[tmp.path().to_path_buf(), file.clone()]).expect("gather");
        assert_eq!(found, vec![file]);
    }
}
