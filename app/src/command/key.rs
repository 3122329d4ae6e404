use tether_checkpoint::CheckpointKey;

pub enum KeyInput {
    Format {
        thread_id: String,
        checkpoint_ns: String,
        checkpoint_id: String,
    },
    Parse {
        key: String,
    },
}

/// Exposes the checkpoint key codec.
#[derive(Debug, Clone, Copy)]
pub struct KeyStrategy;

impl super::CommandStrategy for KeyStrategy {
    type Input = KeyInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        println!("{}", render(input)?);
        Ok(())
    }
}

fn render(input: KeyInput) -> anyhow::Result<String> {
    match input {
        KeyInput::Format {
            thread_id,
            checkpoint_ns,
            checkpoint_id,
        } => Ok(CheckpointKey::new(thread_id, checkpoint_ns, checkpoint_id).format()),
        KeyInput::Parse { key } => {
            let parsed: CheckpointKey = key.parse()?;
            Ok(serde_json::to_string_pretty(&parsed)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn test_format_escapes_segments() {
        let key = render(KeyInput::Format {
            thread_id: "a:b".to_string(),
            checkpoint_ns: String::new(),
            checkpoint_id: "c1".to_string(),
        })
        .expect("format failed");
        assert_eq!(key, r"checkpoint:a\:b::c1");
    }

    #[test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn test_parse_prints_parts() {
        let json = render(KeyInput::Parse {
            key: r"checkpoint:a\:b::c1".to_string(),
        })
        .expect("parse failed");
        let value: serde_json::Value = serde_json::from_str(&json).expect("invalid json");
        assert_eq!(value["threadId"], "a:b");
        assert_eq!(value["checkpointNs"], "");
        assert_eq!(value["checkpointId"], "c1");
    }

    #[test]
    fn test_parse_rejects_malformed_key() {
        assert!(render(KeyInput::Parse {
            key: "checkpoint:only-two".to_string()
        })
        .is_err());
    }
}
