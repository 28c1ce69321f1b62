use crate::output::print_json;
use clap::Subcommand;
use vfq_core::sanitize::{self, FileOperationInput, SanitizeResult};

#[derive(Subcommand)]
pub enum SanitizeSubcommand {
    /// Normalize a relative path and report traversal attempts
    Path { input: String },
    /// Check a single file name
    FileName { input: String },
    /// Check file content for the given file type
    Content {
        input: String,
        /// File type, e.g. html, md, js, json
        #[arg(long = "type", default_value = "txt")]
        file_type: String,
    },
    /// Clean a free-text purpose field
    Purpose { input: String },
    /// Classify input against known attack patterns
    Threats { input: String },
    /// Check every field of a file operation at once
    FileOp {
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        content: Option<String>,
        /// Content type; inferred from the path extension when omitted
        #[arg(long = "type")]
        file_type: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

/// Reports never fail the command: findings are output, not errors.
pub fn run(subcmd: SanitizeSubcommand, json: bool) -> anyhow::Result<()> {
    let result = match subcmd {
        SanitizeSubcommand::Path { input } => sanitize::sanitize_path(&input),
        SanitizeSubcommand::FileName { input } => sanitize::sanitize_file_name(&input),
        SanitizeSubcommand::Content { input, file_type } => {
            sanitize::sanitize_content(&input, &file_type)
        }
        SanitizeSubcommand::Purpose { input } => sanitize::sanitize_purpose(&input),
        SanitizeSubcommand::Threats { input } => return threats(&input, json),
        SanitizeSubcommand::FileOp {
            path,
            content,
            file_type,
            purpose,
            category,
            tags,
        } => {
            let input = FileOperationInput {
                path,
                content,
                file_type,
                purpose,
                category,
                tags,
                ..FileOperationInput::default()
            };
            return file_op(&input, json);
        }
    };
    print_result(&result, json)
}

fn print_result(result: &SanitizeResult, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(result);
    }
    println!("{}", if result.valid { "valid" } else { "invalid" });
    println!("sanitized: {}", result.sanitized);
    for issue in &result.issues {
        println!("  - {issue}");
    }
    Ok(())
}

fn file_op(input: &FileOperationInput, json: bool) -> anyhow::Result<()> {
    let result = sanitize::sanitize_file_operation(input);
    if json {
        return print_json(&result);
    }
    println!("{}", if result.valid { "valid" } else { "invalid" });
    let fields = [
        ("path", &result.sanitized.path),
        ("content", &result.sanitized.content),
        ("purpose", &result.sanitized.purpose),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            println!("{name}: {value}");
        }
    }
    for issue in &result.issues {
        println!("  - {issue}");
    }
    Ok(())
}

fn threats(input: &str, json: bool) -> anyhow::Result<()> {
    let report = sanitize::detect_threats(input);
    if json {
        return print_json(&report);
    }
    println!("threat level: {}", report.threat_level);
    for t in &report.threats {
        println!("  - {}: {}", t.kind, t.pattern);
    }
    Ok(())
}
