//! `validate-mapping` command

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::*;

use crate::transfer::Mapping;

#[derive(Args, Debug)]
pub struct ValidateMappingArgs {
    /// Mapping file to check
    pub file: PathBuf,
}

pub fn handle_validate_mapping_command(args: ValidateMappingArgs) -> Result<()> {
    let mapping = Mapping::load(&args.file)?;

    println!("{} {}", "Valid mapping".green().bold(), mapping.name.cyan());
    println!("  target          {}", mapping.target);
    println!(
        "  identity        {} -> {}",
        mapping.identity.column, mapping.identity.field
    );
    if !mapping.grouping_key.is_empty() {
        println!("  grouped by      {}", mapping.grouping_key.join(", "));
    }
    println!("  header fields   {}", mapping.header.len());
    if let Some(lines) = &mapping.lines {
        println!(
            "  lines           {} on {} ({} columns, {:?})",
            lines.field,
            lines.entity,
            lines.columns.len(),
            lines.policy
        );
    }
    for (name, rule) in &mapping.references {
        let attempts: Vec<&str> = rule.attempts.iter().map(|a| a.field.as_str()).collect();
        let create = if rule.create.is_some() { ", created when missing" } else { "" };
        println!(
            "  reference       {} -> {} by {}{}",
            name,
            rule.entity,
            attempts.join(" / "),
            create
        );
    }
    if let Some(action) = &mapping.post_action {
        println!("  then calls      {}()", action);
    }
    Ok(())
}
