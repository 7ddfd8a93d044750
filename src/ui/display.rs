//! Terminal output of the CLI commands.

use std::path::Path;

use bytesize::ByteSize;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::style;

use crate::broker::Published;
use crate::engine::{Ingested, Keyring};
use crate::store::Job;
use crate::types::{JobId, JobStatus};

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Completed | JobStatus::Archived => Color::Green,
        JobStatus::Error => Color::Red,
        JobStatus::Canceled => Color::DarkGrey,
        JobStatus::Received | JobStatus::InIngestion | JobStatus::Verified => Color::Cyan,
    }
}

/// Builds the job listing.
#[must_use]
pub fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(["Id", "User", "Inbox path", "Status", "Size", "Accession", "Dataset", "Updated"]);

    for job in jobs {
        table.add_row([
            Cell::new(job.id),
            Cell::new(&job.user),
            Cell::new(&job.inbox_path),
            Cell::new(job.status).fg(status_color(job.status)),
            Cell::new(job.archive_size.map(|size| ByteSize::b(size).to_string()).unwrap_or_default()),
            Cell::new(job.accession_id.as_deref().unwrap_or("")),
            Cell::new(job.dataset_id.as_deref().unwrap_or("")),
            Cell::new(&job.updated_at),
        ]);
    }
    table
}

pub fn show_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("{}", style("No jobs found").yellow());
        return;
    }
    println!("{}", jobs_table(jobs));
}

pub fn show_keys(keyring: &Keyring) {
    for key in keyring.service() {
        println!("{} service key {} ({})", style("✓").green(), style(key.key_id()).bold(), key.public().algorithm().label());
    }
    let archive = keyring.archive();
    println!("{} archive key {} ({})", style("✓").green(), style(archive.key_id()).bold(), archive.public().algorithm().label());
}

pub fn show_ingested(ingested: &Ingested) {
    let pass = &ingested.pass;
    println!("{} {}", style("✓").green(), style(format!("Payload archived ({})", ByteSize::b(pass.archived.size()))).bold());
    println!("  cipher            {}", pass.cipher);
    println!("  literal name      {}", pass.literal.name);
    println!("  cleartext sha256  {}", pass.decrypted.sha256_hex());
    println!("  cleartext md5     {}", pass.decrypted.md5_hex());
    println!("  container sha256  {}", pass.encrypted.sha256_hex());
    println!("  archive           {}", ingested.archive_path.display());
    println!("  backup            {}", ingested.backup_path.display());
    println!("  header            {}", ingested.header_hex());
}

pub fn show_verified(job_id: JobId, archive: &Path, backup: &Path) {
    println!("{} {}", style("✓").green(), style(format!("Job {job_id} verified")).bold());
    println!("  archive  {}", archive.display());
    println!("  backup   {}", backup.display());
}

/// Prints every published message, one JSON line each.
pub fn show_published(published: &[Published], handled: u64, dead_letters: usize) {
    for message in published {
        let body = String::from_utf8_lossy(&message.body);
        println!("{} {}", style(format!("{}/{}", message.exchange, message.routing_key)).cyan(), body);
    }

    println!();
    let summary = format!("{handled} message(s) handled, {} published, {dead_letters} dead-lettered", published.len());
    if dead_letters == 0 {
        println!("{} {}", style("✓").green(), style(summary).bold());
    } else {
        println!("{} {}", style("!").yellow(), style(summary).bold());
    }
}
