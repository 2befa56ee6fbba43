use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};

use aardwarc::archive::Archive;
use aardwarc::error::Error;
use aardwarc::getjob::GetJob;
use aardwarc::header::Header;
use aardwarc::rsilo::Rsilo;
use aardwarc::segjob::SegJob;
use aardwarc::{ident, index, silo};

#[derive(Parser)]
#[command(name = "aardwarc", version, about = "Content-addressed WARC archival store")]
struct Cli {
    /// Configuration file (falls back to $AARDWARC_CONF)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an object; prints its canonical id
    Store {
        /// resource or metadata
        #[arg(short = 't', long = "type", default_value = "resource")]
        wtype: String,
        #[arg(short, long, default_value = "application/octet-stream")]
        mime: String,
        /// Referenced object id (metadata only)
        #[arg(short = 'r', long)]
        refers_to: Option<String>,
        /// Forced identifier (metadata only)
        #[arg(short = 'i', long)]
        ident: Option<String>,
        /// Fail instead of succeeding idempotently on a duplicate
        #[arg(long)]
        exclusive: bool,
        /// Input file; `-` or absent reads stdin
        input: Option<PathBuf>,
    },
    /// Retrieve an object by id
    Get {
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Do not print the object's headers
        #[arg(short, long)]
        quiet: bool,
        /// Emit the stored gzip stream instead of the payload
        #[arg(short = 'z', long)]
        gzip: bool,
        id: String,
    },
    /// Resolve index matches and print their record id and type
    Byid { ids: Vec<String> },
    /// Print raw index rows
    Dumpindex {
        /// Only rows of this type: resource, metadata or warcinfo
        #[arg(short = 't', long = "type")]
        wtype: Option<String>,
        id_parts: Vec<String>,
    },
    /// Keep the ids on stdin that are in the archive (-v: that are not)
    Filter {
        #[arg(short = 'v', long)]
        invert: bool,
    },
    /// Archive parameters and usage
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Verify every silo record against its digests, lengths and index
    Audit,
    /// Fold the index appendix into the sorted file
    Housekeeping,
    /// Deterministic test byte generator
    Testbytes {
        #[arg(short = 'n', long = "bytes")]
        nbytes: u64,
    },
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let conf = cli
        .config
        .or_else(|| std::env::var_os("AARDWARC_CONF").map(PathBuf::from));
    let Some(conf) = conf else {
        eprintln!("No configuration: give -c or set AARDWARC_CONF");
        return ExitCode::from(2);
    };
    let aa = match Archive::open(&conf) {
        Ok(aa) => aa,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    aa.read_cache();

    match run(&aa, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            match e {
                Error::Config(_) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn run(aa: &Archive, cmd: Commands) -> aardwarc::Result<()> {
    match cmd {
        // ── Store ────────────────────────────────────────────────────────────
        Commands::Store {
            wtype,
            mime,
            refers_to,
            ident,
            exclusive,
            input,
        } => {
            let wt = match wtype.to_ascii_lowercase().as_str() {
                "resource" => "resource",
                "metadata" => "metadata",
                _ => return Err(Error::Config(format!("illegal type {wtype:?}"))),
            };
            if wt != "metadata" && (refers_to.is_some() || ident.is_some()) {
                return Err(Error::Config(
                    "-r and -i only apply to metadata".to_owned(),
                ));
            }
            if wt == "metadata" && refers_to.is_none() {
                return Err(Error::Config("metadata needs -r".to_owned()));
            }
            check_mime(aa, wt, &mime)?;

            let mut hd = Header::new(aa);
            hd.set_date();
            hd.set("Content-Type", &mime);
            hd.set("WARC-Type", wt);
            if let Some(r) = &refers_to {
                // The reference must resolve before we bind to it.
                let gj = GetJob::new(aa, r)?;
                let canon = ident::digest_to_ident(aa, gj.id())?;
                hd.set("WARC-Refers-To", format!("<{canon}>"));
            }

            let mut sj = SegJob::new(aa, &hd, ident.as_deref())?;
            let mut src: Box<dyn Read> = match input {
                None => Box::new(io::stdin().lock()),
                Some(p) if p.as_os_str() == "-" => Box::new(io::stdin().lock()),
                Some(p) => Box::new(File::open(p)?),
            };
            let mut buf = vec![0u8; 128 * 1024];
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sj.feed(&buf[..n])?;
            }
            let id = if exclusive {
                sj.commit_exclusive()?
            } else {
                sj.commit()?
            };
            println!("{id}");
        }

        // ── Get ──────────────────────────────────────────────────────────────
        Commands::Get {
            output,
            quiet,
            gzip,
            id,
        } => {
            let mut gj = GetJob::new(aa, &id)?;
            if !quiet {
                let hdrs = gj.headers()?;
                if output.is_some() {
                    io::stdout().write_all(&hdrs)?;
                } else {
                    io::stderr().write_all(&hdrs)?;
                }
            }
            let mut dst: Box<dyn Write> = match &output {
                Some(p) => Box::new(File::create(p)?),
                None => Box::new(io::stdout().lock()),
            };
            let mut sha = Sha256::new();
            gj.iter(
                &mut |chunk| {
                    if !gzip {
                        sha.update(chunk);
                    }
                    dst.write_all(chunk)?;
                    Ok(())
                },
                gzip,
            )?;
            dst.flush()?;
            if !gzip {
                let got = hex::encode(sha.finalize());
                let hd = gj.header(true);
                let want = hd
                    .get("WARC-Payload-Digest")
                    .or_else(|| hd.get("WARC-Block-Digest"))
                    .and_then(|d| d.strip_prefix("sha256:"))
                    .unwrap_or("");
                if got != want {
                    return Err(Error::IntegrityMismatch(format!(
                        "payload digest {got} does not match stored {want}"
                    )));
                }
            }
        }

        // ── Byid ─────────────────────────────────────────────────────────────
        Commands::Byid { ids } => {
            for id in &ids {
                let frag = strip_prefix_fragment(aa, id)?;
                index::iter(aa, Some(&frag), &mut |e| {
                    let mut rs = Rsilo::open(aa, e.silo)?;
                    rs.seek(e.offset)?;
                    if let Some(hd) = rs.read_header()? {
                        println!(
                            "id {} wt {}",
                            hd.get_id(),
                            hd.get("WARC-Type").unwrap_or("?")
                        );
                    }
                    Ok(false)
                })?;
            }
        }

        // ── Dumpindex ────────────────────────────────────────────────────────
        Commands::Dumpindex { wtype, id_parts } => {
            let want = match wtype.as_deref() {
                None => 0,
                Some("resource") => index::F_RESOURCE,
                Some("metadata") => index::F_METADATA,
                Some("warcinfo") => index::F_WARCINFO,
                Some(t) => return Err(Error::Config(format!("wrong type {t:?}"))),
            };
            let mut dump = |e: &index::Entry| -> aardwarc::Result<bool> {
                if want == 0 || e.flags & want != 0 {
                    println!(
                        "{} 0x{:08x} {:8} {:12} {}",
                        e.key, e.flags, e.silo, e.offset, e.cont
                    );
                }
                Ok(false)
            };
            if id_parts.is_empty() {
                index::iter(aa, None, &mut dump)?;
            } else {
                for part in &id_parts {
                    let frag = strip_prefix_fragment(aa, part)?;
                    index::iter(aa, Some(&frag), &mut dump)?;
                }
            }
        }

        // ── Filter ───────────────────────────────────────────────────────────
        Commands::Filter { invert } => {
            for line in io::stdin().lock().lines() {
                let line = line?;
                let id = line.trim();
                if id.is_empty() {
                    continue;
                }
                let present = match GetJob::new(aa, id) {
                    Ok(_) => true,
                    Err(Error::NotFound(_)) => false,
                    Err(Error::IdInvalid(e)) => {
                        eprintln!("{id}: invalid id: {e}");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if present != invert {
                    println!("{id}");
                }
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { json } => info(aa, json)?,

        // ── Audit ────────────────────────────────────────────────────────────
        Commands::Audit => {
            let errors = audit(aa)?;
            if errors > 0 {
                return Err(Error::IntegrityMismatch(format!(
                    "audit found {errors} problem(s)"
                )));
            }
            println!("Audit clean");
        }

        // ── Housekeeping ─────────────────────────────────────────────────────
        Commands::Housekeeping => index::resort(aa)?,

        // ── Testbytes ────────────────────────────────────────────────────────
        Commands::Testbytes { mut nbytes } => {
            let mut out = io::stdout().lock();
            let mut dig = [0u8; 32];
            while nbytes > 0 {
                dig = Sha256::digest(dig).into();
                let take = (nbytes as usize).min(dig.len());
                out.write_all(&dig[..take])?;
                nbytes -= take as u64;
            }
        }
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn check_mime(aa: &Archive, wt: &str, mime: &str) -> aardwarc::Result<()> {
    let section = format!("{wt}.mime-types");
    if aa.cfg().find(&section, mime).is_some() {
        return Ok(());
    }
    let mut msg = format!("illegal mime-type for {wt}, pick one of:");
    for (name, _) in aa.cfg().entries(&section) {
        msg.push_str("\n\t");
        msg.push_str(name);
    }
    Err(Error::Config(msg))
}

/// Accept an id fragment with or without the archive prefix; hex only.
fn strip_prefix_fragment(aa: &Archive, id: &str) -> aardwarc::Result<String> {
    let mut id = id;
    let plen = aa.prefix().len();
    if id.len() >= plen && id[..plen].eq_ignore_ascii_case(aa.prefix()) {
        id = &id[plen..];
    }
    if !id.bytes().all(|b| b.is_ascii_hexdigit()) || id.is_empty() {
        return Err(Error::IdInvalid(format!("invalid id fragment {id:?}")));
    }
    Ok(id.to_ascii_lowercase())
}

#[derive(serde::Serialize)]
struct InfoReport<'a> {
    id_size_bits:         usize,
    prefix:               &'a str,
    silo_directory:       &'a std::path::Path,
    silo_max_size:        u64,
    silos:                u64,
    silo_bytes:           u64,
    index_sorted_bytes:   u64,
    index_appendix_bytes: u64,
}

fn info(aa: &Archive, json: bool) -> aardwarc::Result<()> {
    let mut silos = 0u64;
    let mut bytes = 0u64;
    silo::iter(aa, |p, _| {
        silos += 1;
        bytes += std::fs::metadata(p)?.len();
        Ok(())
    })?;
    let idx_len = |suffix: &str| {
        std::fs::metadata(aa.silo_dirname().join(format!("index.{suffix}")))
            .map(|m| m.len())
            .unwrap_or(0)
    };
    let report = InfoReport {
        id_size_bits:         aa.id_size() * 4,
        prefix:               aa.prefix(),
        silo_directory:       aa.silo_dirname(),
        silo_max_size:        aa.silo_max_size(),
        silos,
        silo_bytes:           bytes,
        index_sorted_bytes:   idx_len("sorted"),
        index_appendix_bytes: idx_len("appendix"),
    };
    if json {
        let v = ("AardWARC", "info", "1", &report);
        println!("{}", serde_json::to_string_pretty(&v).expect("info serializes"));
    } else {
        println!("id_size:        {} bits", report.id_size_bits);
        println!("prefix:         {}", report.prefix);
        println!("silo.directory: {}", report.silo_directory.display());
        println!("silo.max_size:  {}", report.silo_max_size);
        println!("silos:          {silos} ({bytes} bytes)");
        println!("index.sorted:   {} bytes", report.index_sorted_bytes);
        println!("index.appendix: {} bytes", report.index_appendix_bytes);
    }
    Ok(())
}

/// Walk every record of every silo; report what disagrees with itself,
/// the index, or its segment chain.  Returns the number of problems.
fn audit(aa: &Archive) -> aardwarc::Result<u64> {
    let mut errors = 0u64;
    let mut chain_heads: Vec<String> = Vec::new();

    silo::iter(aa, |path, silo_no| {
        let mut rs = Rsilo::open_path(aa, path)?;
        loop {
            let offset = rs.tell()?;
            let hd = match rs.read_header() {
                Ok(Some(hd)) => hd,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("silo {silo_no} offset {offset}: unreadable header: {e}");
                    errors += 1;
                    break;
                }
            };
            let mut sha = Sha256::new();
            let mut size = 0u64;
            if let Err(e) = rs.read_chunk(&mut |c| {
                sha.update(c);
                size += c.len() as u64;
                Ok(())
            }) {
                eprintln!("silo {silo_no} record {}: {e}", hd.get_id());
                errors += 1;
                break;
            }
            let digest = hex::encode(sha.finalize());

            errors += check_header(&hd, "Content-Length", &size.to_string());
            errors += check_header(&hd, "WARC-Block-Digest", &format!("sha256:{digest}"));
            errors += check_record_id(aa, &hd, &digest);

            // Every record must be findable at its location.
            let mut found = false;
            index::iter(aa, Some(hd.get_id()), &mut |e| {
                found = e.silo == silo_no && e.offset == offset;
                Ok(found)
            })?;
            if !found {
                eprintln!("record {} not indexed at silo {silo_no}/{offset}", hd.get_id());
                errors += 1;
            }

            if hd.get_number("WARC-Segment-Number") == 1 {
                chain_heads.push(hd.get_id().to_owned());
            }
            if let Err(e) = rs.skip_cr_nl() {
                eprintln!("silo {silo_no} record {}: {e}", hd.get_id());
                errors += 1;
                break;
            }
        }
        Ok(())
    })?;

    // Segmented objects: reassemble and verify the whole payload.
    for id in chain_heads {
        let mut gj = match GetJob::new(aa, &id) {
            Ok(gj) => gj,
            Err(e) => {
                eprintln!("segmented object {id}: {e}");
                errors += 1;
                continue;
            }
        };
        let mut sha = Sha256::new();
        let mut size = 0u64;
        gj.iter(
            &mut |c| {
                sha.update(c);
                size += c.len() as u64;
                Ok(())
            },
            false,
        )?;
        let digest = hex::encode(sha.finalize());
        let hd = gj.header(true);
        errors += check_header(hd, "WARC-Payload-Digest", &format!("sha256:{digest}"));
        let last = gj.header(false);
        errors += check_header(last, "WARC-Segment-Total-Length", &size.to_string());
    }
    Ok(errors)
}

fn check_header(hd: &Header, name: &str, expect: &str) -> u64 {
    match hd.get(name) {
        None => {
            eprintln!("record {}: {name} missing", hd.get_id());
            1
        }
        Some(is) if is != expect => {
            eprintln!("record {}: {name} is {is:?}, should be {expect:?}", hd.get_id());
            1
        }
        Some(_) => 0,
    }
}

fn check_record_id(aa: &Archive, hd: &Header, block_digest: &str) -> u64 {
    let derived = match hd.get("WARC-Type") {
        // Segment 1 ids derive from the payload digest; checked with the
        // reassembled chain instead.
        _ if hd.get("WARC-Segment-Number") == Some("1") => return 0,
        Some("warcinfo") => {
            let Some(filename) = hd.get("WARC-Filename") else {
                eprintln!("record {}: WARC-Filename missing", hd.get_id());
                return 1;
            };
            let mut sha = Sha256::new();
            sha.update(block_digest.as_bytes());
            sha.update(b"\n");
            sha.update(filename.as_bytes());
            sha.update(b"\n");
            hex::encode(sha.finalize())[..aa.id_size()].to_owned()
        }
        Some(_) => match ident::create(aa, hd, block_digest, None) {
            Ok(id) => id,
            Err(e) => {
                eprintln!("record {}: {e}", hd.get_id());
                return 1;
            }
        },
        None => {
            eprintln!("record {}: WARC-Type missing", hd.get_id());
            return 1;
        }
    };
    if !derived.eq_ignore_ascii_case(hd.get_id()) {
        eprintln!(
            "record {}: id should be {derived} for its contents",
            hd.get_id()
        );
        return 1;
    }
    0
}
