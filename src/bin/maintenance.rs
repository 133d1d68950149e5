use std::{env, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use uuid::Uuid;

use finsight::{
    accounts,
    analytics::{self, RebuildRequest},
    config::AppConfig,
    db::{self, PgPool},
    dead_letters,
    jobs::{self, NewUpload, CANDIDATE_UNKNOWN},
    normalize::DocumentKind,
    reconcile::{PlanOptions, UpdateMode, RAW_INSTITUTION_NAMES},
    s3,
    storage::{content_digest, upload_key, ObjectStorage},
};

const USAGE: &str = "Usage: maintenance <command>
  enqueue <user_id> <path> [payslip|bank_statement]
  requeue <user_id> <file_id>
  reprocess <user_id> <file_id>
  rebuild <user_id> <YYYY-MM>
  dead-letters
  account-names <account_id> replace <name>
  account-names <account_id> append <name>...
  account-names <account_id> rename <old> <new>";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    match command.as_str() {
        "enqueue" => enqueue(rest).await?,
        "requeue" => requeue(rest)?,
        "reprocess" => reprocess(rest)?,
        "rebuild" => rebuild(rest)?,
        "dead-letters" => list_dead_letters()?,
        "account-names" => account_names(rest)?,
        cmd => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load() -> Result<(AppConfig, PgPool)> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    Ok((config, pool))
}

fn uuid_arg(args: &[String], index: usize, name: &str) -> Result<Uuid> {
    let raw = args
        .get(index)
        .ok_or_else(|| anyhow!("missing <{name}>\n{USAGE}"))?;
    Uuid::parse_str(raw).with_context(|| format!("invalid {name} '{raw}'"))
}

async fn enqueue(args: &[String]) -> Result<()> {
    let user_id = uuid_arg(args, 0, "user_id")?;
    let path = args.get(1).ok_or_else(|| anyhow!("missing <path>\n{USAGE}"))?;
    let candidate_type = match args.get(2) {
        Some(raw) => DocumentKind::from_catalogue_key(raw)
            .map(|kind| kind.catalogue_key())
            .ok_or_else(|| anyhow!("unsupported document type '{raw}'"))?,
        None => CANDIDATE_UNKNOWN,
    };

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let original_name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload")
        .to_string();
    let content_type = mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string());

    let (config, pool) = load()?;
    let storage = s3::connect_storage(&config).await?;

    let file_id = Uuid::new_v4();
    let storage_key = upload_key(user_id, file_id, &original_name);
    let content_hash = content_digest(&bytes);
    storage
        .put_object(&storage_key, bytes, content_type.clone())
        .await?;

    let mut conn = pool.get().context("failed to get database connection")?;
    let job = jobs::register_upload(
        &mut conn,
        NewUpload {
            user_id,
            file_id,
            storage_key,
            original_name,
            content_type,
            content_hash,
            candidate_type: candidate_type.to_string(),
        },
    )?;

    println!("Enqueued job {} for file {}.", job.id, job.file_id);
    Ok(())
}

fn requeue(args: &[String]) -> Result<()> {
    let user_id = uuid_arg(args, 0, "user_id")?;
    let file_id = uuid_arg(args, 1, "file_id")?;
    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    match jobs::requeue_job(&mut conn, user_id, file_id)? {
        Some(job) => println!("Requeued job {} ({}).", job.id, job.original_name),
        None => println!("No failed, rejected or dead-lettered job for that file."),
    }
    Ok(())
}

fn reprocess(args: &[String]) -> Result<()> {
    let user_id = uuid_arg(args, 0, "user_id")?;
    let file_id = uuid_arg(args, 1, "file_id")?;
    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    match jobs::reprocess_job(&mut conn, user_id, file_id)? {
        Some(job) => println!("Queued job {} ({}) for reprocessing.", job.id, job.original_name),
        None => println!("No succeeded job for that file."),
    }
    Ok(())
}

fn rebuild(args: &[String]) -> Result<()> {
    let user_id = uuid_arg(args, 0, "user_id")?;
    let period = args.get(1).ok_or_else(|| anyhow!("missing <YYYY-MM>\n{USAGE}"))?;
    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let outcome = analytics::rebuild(
        &mut conn,
        user_id,
        &RebuildRequest {
            period_month: Some(period.clone()),
            ..RebuildRequest::default()
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn list_dead_letters() -> Result<()> {
    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let letters = dead_letters::list_unresolved(&mut conn, 100)?;

    if letters.is_empty() {
        println!("No unresolved dead letters.");
        return Ok(());
    }
    for letter in letters {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            letter.created_at, letter.user_id, letter.file_id, letter.reason, letter.details
        );
    }
    Ok(())
}

fn account_names(args: &[String]) -> Result<()> {
    let account_id = uuid_arg(args, 0, "account_id")?;
    let action = args.get(1).map(String::as_str);
    let values = args.get(2..).unwrap_or_default().to_vec();

    let (mode, candidates, options) = match (action, values.as_slice()) {
        (Some("replace"), [name]) => (
            UpdateMode::Replace,
            vec![name.clone()],
            PlanOptions::for_field(RAW_INSTITUTION_NAMES),
        ),
        (Some("append"), names) if !names.is_empty() => (
            UpdateMode::AppendUnique,
            names.to_vec(),
            PlanOptions::for_field(RAW_INSTITUTION_NAMES),
        ),
        (Some("rename"), [old, new]) => (
            UpdateMode::ElementUpdate,
            vec![new.clone()],
            PlanOptions::for_field(RAW_INSTITUTION_NAMES).matching(old.clone()),
        ),
        _ => bail!("invalid account-names arguments\n{USAGE}"),
    };

    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let plan = accounts::reconcile_field(&mut conn, account_id, mode, &candidates, &options)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
