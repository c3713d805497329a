//! `dcat`: POSIX-style commands against a diskcat catalog.
//!
//! Exit status: 0 on success, 1 on user errors, 2 on system errors.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::debug;

use diskcat::errors::ErrorCategory;
use diskcat::iodriver::OpenFlags;
use diskcat::{Catalog as _, DirCursor as _, IoDriver as _, IoHandler as _, PoolManager as _};
use diskcat::{
    DmError, DmResult, ErrorCode, Extensible, PluginManager, SecurityCredentials, StackInstance,
};

#[derive(Parser)]
#[command(name = "dcat", version, about = "diskcat catalog client")]
struct Cli {
    /// Stack configuration file.
    #[arg(long, default_value = "/etc/diskcat.conf")]
    config: PathBuf,

    /// Client name (DN) to run as.
    #[arg(long, default_value = "root")]
    user: String,

    /// FQANs to present (repeatable).
    #[arg(long = "fqan")]
    fqans: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory.
    Ls { path: String },
    /// Print the full metadata of an entry.
    Stat { path: String },
    /// Create a directory.
    Mkdir {
        path: String,
        /// Octal creation mode.
        #[arg(default_value = "755")]
        mode: String,
    },
    /// Remove a file, or an empty directory with -d.
    Rm {
        path: String,
        /// Remove a directory instead of a file.
        #[arg(short = 'd', long)]
        directory: bool,
    },
    /// Rename or move an entry.
    Mv { old: String, new: String },
    /// Change permission bits (octal).
    Chmod { mode: String, path: String },
    /// Change owner and/or group id.
    Chown {
        path: String,
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        gid: Option<u32>,
    },
    /// Print the comment of an entry.
    Getcomment { path: String },
    /// Set the comment of an entry.
    Setcomment { path: String, comment: String },
    /// List the replicas of a file.
    Getreplicas { path: String },
    /// Register a replica for a file.
    Addreplica {
        path: String,
        server: String,
        rfn: String,
        pool: String,
        filesystem: String,
    },
    /// Upload a local file to a new logical name.
    Put { local: PathBuf, logical: String },
    /// Download a logical file.
    Get { logical: String, local: PathBuf },
}

fn mode_from_octal(text: &str) -> DmResult<u32> {
    u32::from_str_radix(text, 8)
        .map_err(|_| DmError::new(ErrorCode::INVALID_VALUE, format!("bad octal mode '{text}'")))
}

fn type_char(meta: &diskcat::ExtendedStat) -> char {
    if meta.is_directory() {
        'd'
    } else if meta.is_link() {
        'l'
    } else {
        '-'
    }
}

fn run(cli: Cli) -> DmResult<()> {
    let mut manager = PluginManager::new();
    manager.load_configuration(&cli.config)?;
    let mut stack = StackInstance::new(Arc::new(manager));

    let mut credentials = SecurityCredentials::for_client(&cli.user);
    credentials.remote_address = "127.0.0.1".to_string();
    credentials.fqans = cli.fqans.clone();
    stack.set_security_credentials(&credentials)?;

    match cli.command {
        Command::Ls { path } => {
            let mut cursor = stack.catalog()?.open_dir(&path)?;
            while let Some(entry) = cursor.next_entry()? {
                println!(
                    "{}{:o}\t{}\t{}\t{}\t{}",
                    type_char(&entry),
                    entry.mode & 0o7777,
                    entry.uid,
                    entry.gid,
                    entry.size,
                    entry.name
                );
            }
        }
        Command::Stat { path } => {
            let meta = stack.catalog()?.extended_stat(&path, true)?;
            println!("ino:    {}", meta.ino);
            println!("parent: {}", meta.parent);
            println!("name:   {}", meta.name);
            println!("mode:   {}{:o}", type_char(&meta), meta.mode & 0o7777);
            println!("nlink:  {}", meta.nlink);
            println!("owner:  {}:{}", meta.uid, meta.gid);
            println!("size:   {}", meta.size);
            println!("status: {}", meta.status.as_char());
            if let Some(guid) = &meta.guid {
                println!("guid:   {guid}");
            }
            if !meta.csumtype.is_empty() {
                println!("csum:   {}:{}", meta.csumtype, meta.csumvalue);
            }
            if !meta.acl.is_empty() {
                println!("acl:    {}", meta.acl);
            }
        }
        Command::Mkdir { path, mode } => {
            let mode = mode_from_octal(&mode)?;
            stack.catalog()?.make_dir(&path, mode)?;
        }
        Command::Rm { path, directory } => {
            if directory {
                stack.catalog()?.remove_dir(&path)?;
            } else {
                stack.catalog()?.unlink(&path)?;
            }
        }
        Command::Mv { old, new } => stack.catalog()?.rename(&old, &new)?,
        Command::Chmod { mode, path } => {
            let mode = mode_from_octal(&mode)?;
            stack.catalog()?.set_mode(&path, mode)?;
        }
        Command::Chown { path, uid, gid } => {
            stack.catalog()?.set_owner(&path, uid, gid, true)?;
        }
        Command::Getcomment { path } => {
            println!("{}", stack.catalog()?.get_comment(&path)?);
        }
        Command::Setcomment { path, comment } => {
            stack.catalog()?.set_comment(&path, &comment)?;
        }
        Command::Getreplicas { path } => {
            for replica in stack.catalog()?.get_replicas(&path)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    replica.replica_id,
                    replica.status.as_char(),
                    replica.server,
                    replica.pool,
                    replica.rfn
                );
            }
        }
        Command::Addreplica {
            path,
            server,
            rfn,
            pool,
            filesystem,
        } => {
            let meta = stack.catalog()?.extended_stat(&path, true)?;
            stack.catalog()?.add_replica(&diskcat::Replica {
                fileid: meta.ino,
                server,
                rfn,
                pool,
                filesystem,
                ..Default::default()
            })?;
        }
        Command::Put { local, logical } => put(&mut stack, &local, &logical)?,
        Command::Get { logical, local } => get(&mut stack, &logical, &local)?,
    }
    Ok(())
}

fn put(stack: &mut StackInstance, local: &PathBuf, logical: &str) -> DmResult<()> {
    let location = stack.pool_manager()?.where_to_write(logical)?;
    let chunk = location
        .chunks
        .first()
        .ok_or_else(|| DmError::new(ErrorCode::INTERNAL_ERROR, "empty write location"))?
        .clone();
    debug!("uploading {} to {}:{}", local.display(), chunk.host, chunk.path);

    let mut source = File::open(local)?;
    let mut handler = stack.io_driver()?.create_io_handler(
        &chunk.path,
        OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
        &chunk.query,
        0o664,
    )?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        let mut off = 0;
        while off < n {
            off += handler.write(&buffer[off..n])?;
        }
    }
    handler.flush()?;
    handler.close()?;

    let mut params = Extensible::new();
    params.extend_from(&chunk.query);
    stack.io_driver()?.done_writing(&chunk.path, &params)?;
    println!("{logical}");
    Ok(())
}

fn get(stack: &mut StackInstance, logical: &str, local: &PathBuf) -> DmResult<()> {
    let location = stack.pool_manager()?.where_to_read(logical)?;
    let chunk = location
        .chunks
        .first()
        .ok_or_else(|| DmError::new(ErrorCode::INTERNAL_ERROR, "empty read location"))?
        .clone();
    debug!("fetching {}:{}", chunk.host, chunk.path);

    let mut handler = stack.io_driver()?.create_io_handler(
        &chunk.path,
        OpenFlags::empty(),
        &chunk.query,
        0o664,
    )?;
    let mut sink = File::create(local)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = handler.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buffer[..n])?;
    }
    handler.close()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dcat: {e}");
            match e.code().category() {
                ErrorCategory::User => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}
