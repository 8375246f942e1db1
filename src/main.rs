use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use prismsort::albums::{suggest_albums, AlbumSuggestionRequest};
use prismsort::config::Config;
use prismsort::db::SqliteStore;
use prismsort::duplicates::{find_duplicates, similar_photos, DuplicateRequest};
use prismsort::era::estimate_photo_era;
use prismsort::export::{export_report, render, ExportFormat, Report};
use prismsort::faces::{
    find_matches, find_outliers, scan_all_outliers, scan_all_subjects, MatchRequest,
    OutlierRequest, ScanSummary, SubjectScan,
};
use prismsort::logging;
use prismsort::sync::import_file;
use prismsort::tasks::{CancelFlag, Progress, TaskUpdate};

enum Command {
    Import(PathBuf),
    Match {
        subject: String,
        threshold: Option<f32>,
        limit: Option<usize>,
    },
    Outliers {
        subject: String,
        threshold: Option<f32>,
    },
    ScanPeople,
    ScanOutliers,
    Duplicates {
        album: Option<String>,
        threshold: Option<f32>,
        groups: Option<usize>,
    },
    SuggestAlbums {
        photo: Option<String>,
        threshold: Option<f32>,
        top_k: Option<usize>,
    },
    Era(String),
    Similar {
        photo: String,
        limit: Option<usize>,
    },
}

struct Options {
    config_path: Option<PathBuf>,
    format: ExportFormat,
    output: Option<PathBuf>,
    command: Command,
}

/// Command-specific flags.
#[derive(Default)]
struct Flags {
    threshold: Option<f32>,
    limit: Option<usize>,
    groups: Option<usize>,
    top_k: Option<usize>,
    album: Option<String>,
    photo: Option<String>,
}

impl Flags {
    /// Fail if a flag outside `allowed` was given to `command`.
    fn only(&self, command: &str, allowed: &[&str]) -> Result<()> {
        let given = [
            ("--threshold", self.threshold.is_some()),
            ("--limit", self.limit.is_some()),
            ("--groups", self.groups.is_some()),
            ("--top-k", self.top_k.is_some()),
            ("--album", self.album.is_some()),
            ("--photo", self.photo.is_some()),
        ];
        for (flag, set) in given {
            if set && !allowed.contains(&flag) {
                bail!("{} does not accept {}", command, flag);
            }
        }
        Ok(())
    }
}

fn parse_count(flag: &str, v: &str) -> Result<usize> {
    v.parse::<usize>()
        .with_context(|| format!("bad count {:?} for {}", v, flag))
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut config_path = None;
    let mut format = ExportFormat::default();
    let mut output = None;
    let mut positional: Vec<String> = Vec::new();
    let mut flags = Flags::default();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut value = || -> Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .with_context(|| format!("{} requires an argument", arg))
        };
        match arg {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("prismsort {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => config_path = Some(PathBuf::from(value()?)),
            "--format" | "-f" => format = value()?.parse()?,
            "--output" | "-o" => output = Some(PathBuf::from(value()?)),
            "--threshold" | "-t" => {
                let v = value()?;
                flags.threshold =
                    Some(v.parse::<f32>().with_context(|| format!("bad threshold {:?}", v))?);
            }
            "--limit" | "-n" => flags.limit = Some(parse_count("--limit", &value()?)?),
            "--groups" => flags.groups = Some(parse_count("--groups", &value()?)?),
            "--top-k" => flags.top_k = Some(parse_count("--top-k", &value()?)?),
            "--album" => flags.album = Some(value()?),
            "--photo" => flags.photo = Some(value()?),
            other if other.starts_with('-') => bail!("Unknown argument: {}", other),
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next().unwrap_or_default();
    let mut operand = |what: &str| -> Result<String> {
        positional
            .next()
            .with_context(|| format!("{} requires {}", name, what))
    };

    let command = match name.as_str() {
        "import" => {
            flags.only("import", &[])?;
            Command::Import(PathBuf::from(operand("a snapshot file")?))
        }
        "match" => {
            flags.only("match", &["--threshold", "--limit"])?;
            Command::Match {
                subject: operand("a subject")?,
                threshold: flags.threshold,
                limit: flags.limit,
            }
        }
        "outliers" => {
            flags.only("outliers", &["--threshold"])?;
            Command::Outliers {
                subject: operand("a subject")?,
                threshold: flags.threshold,
            }
        }
        "scan-people" => {
            flags.only("scan-people", &[])?;
            Command::ScanPeople
        }
        "scan-outliers" => {
            flags.only("scan-outliers", &[])?;
            Command::ScanOutliers
        }
        "duplicates" => {
            flags.only("duplicates", &["--album", "--threshold", "--groups"])?;
            Command::Duplicates {
                album: flags.album,
                threshold: flags.threshold,
                groups: flags.groups,
            }
        }
        "suggest-albums" => {
            flags.only("suggest-albums", &["--photo", "--threshold", "--top-k"])?;
            Command::SuggestAlbums {
                photo: flags.photo,
                threshold: flags.threshold,
                top_k: flags.top_k,
            }
        }
        "era" => {
            flags.only("era", &[])?;
            Command::Era(operand("a photo uid")?)
        }
        "similar" => {
            flags.only("similar", &["--limit"])?;
            Command::Similar {
                photo: operand("a photo uid")?,
                limit: flags.limit,
            }
        }
        "" => {
            print_help();
            std::process::exit(1);
        }
        other => bail!("Unknown command: {}", other),
    };

    Ok(Options {
        config_path,
        format,
        output,
        command,
    })
}

fn print_help() {
    println!(
        r#"prismsort - embedding similarity and reconciliation for a photo library

USAGE:
    prismsort [OPTIONS] <COMMAND>

COMMANDS:
    import FILE                  Import a JSON snapshot of embeddings and cached state
    match SUBJECT                Find faces that belong to a person
    outliers SUBJECT             Find faces linked to a person that do not fit
    scan-people                  Run match for every person
    scan-outliers                Run outliers for every person
    duplicates                   Group near-duplicate photos
    suggest-albums               Suggest albums for unsorted photos
    era PHOTO_UID                Estimate the era a photo was taken in
    similar PHOTO_UID            List the most similar photos

OPTIONS:
    --config, -c PATH   Path to config file
    --format, -f FMT    Output format: json (default) or csv
    --output, -o PATH   Write output to a file instead of stdout
    --threshold, -t X   Distance (match, outliers, duplicates) or similarity
                        (suggest-albums) threshold
    --limit, -n N       Result cap (match, similar)
    --groups N          Duplicate group cap
    --top-k N           Albums suggested per photo
    --album UID         Restrict duplicates to one album
    --photo UID         Suggest albums for one photo only
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PRISMSORT_CONFIG    Path to config file (overrides default location)
    PRISMSORT_LOG       Log filter (trace, debug, info, warn, error)
"#
    );
}

fn emit<R: Report + ?Sized>(report: &R, options: &Options) -> Result<()> {
    match &options.output {
        Some(path) => {
            let rows = export_report(report, path, options.format)?;
            eprintln!(
                "Wrote {} rows as {} to {}",
                rows,
                options.format.name(),
                path.display()
            );
        }
        None => println!("{}", render(report, options.format)?),
    }
    Ok(())
}

/// Run a batch scan while printing its progress to stderr.
fn run_scan<F>(scan: F) -> Result<Vec<SubjectScan>>
where
    F: FnOnce(&Progress) -> prismsort::Result<Vec<SubjectScan>>,
{
    let (tx, rx) = mpsc::channel();
    let printer = thread::spawn(move || {
        for update in rx {
            match update {
                TaskUpdate::Started { task, total } => {
                    eprintln!("{}: {} people", task.display_name(), total)
                }
                TaskUpdate::Progress(p) => eprintln!(
                    "[{:>3}%] {}",
                    p.percent(),
                    p.current_item.unwrap_or_default()
                ),
                TaskUpdate::Completed { message } => eprintln!("{}", message),
                TaskUpdate::Cancelled => eprintln!("Cancelled"),
                TaskUpdate::Failed { error } => eprintln!("Failed: {}", error),
            }
        }
    });

    let result = scan(&Progress::channel(tx));
    let _ = printer.join();
    Ok(result?)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Run with --help for usage");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(None) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let config = match &options.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = SqliteStore::open(&config.db_path)?;
    store.initialize()?;
    tracing::info!(db = %config.db_path.display(), "Store opened");

    let limit = config.search.limit;
    let cancel = CancelFlag::new();

    match &options.command {
        Command::Import(path) => {
            let stats = import_file(&store, path)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Match {
            subject,
            threshold,
            limit: cap,
        } => {
            let request = MatchRequest {
                subject_name: subject.clone(),
                distance_threshold: *threshold,
                limit: *cap,
            };
            emit(&find_matches(&store, &request, &config.faces, limit)?, &options)?;
        }
        Command::Outliers { subject, threshold } => {
            let request = OutlierRequest {
                subject_name: subject.clone(),
                distance_threshold: *threshold,
                limit: None,
            };
            emit(&find_outliers(&store, &request, &config.faces, limit)?, &options)?;
        }
        Command::ScanPeople | Command::ScanOutliers => {
            let outliers = matches!(options.command, Command::ScanOutliers);
            let scans = run_scan(|progress| {
                if outliers {
                    scan_all_outliers(&store, &config.faces, limit, &cancel, progress)
                } else {
                    scan_all_subjects(&store, &config.faces, limit, &cancel, progress)
                }
            })?;
            let summaries: Vec<ScanSummary> = scans.iter().map(SubjectScan::summary).collect();
            emit(summaries.as_slice(), &options)?;
        }
        Command::Duplicates {
            album,
            threshold,
            groups,
        } => {
            let request = DuplicateRequest {
                album_uid: album.clone(),
                distance_threshold: *threshold,
                group_limit: *groups,
            };
            emit(
                &find_duplicates(&store, &request, &config.duplicates, limit, &cancel)?,
                &options,
            )?;
        }
        Command::SuggestAlbums {
            photo,
            threshold,
            top_k,
        } => {
            let request = AlbumSuggestionRequest {
                photo_uid: photo.clone(),
                similarity_threshold: *threshold,
                top_k: *top_k,
            };
            emit(
                &suggest_albums(&store, &request, &config.albums, limit, &cancel)?,
                &options,
            )?;
        }
        Command::Era(photo) => {
            emit(&estimate_photo_era(&store, photo)?, &options)?;
        }
        Command::Similar { photo, limit: cap } => {
            let neighbors = similar_photos(&store, photo, cap.unwrap_or(20))?;
            emit(neighbors.as_slice(), &options)?;
        }
    }

    Ok(())
}
