//! Naming collaborator used to derive `normalized_name` for new entries.

pub trait NamingConvention: Send + Sync {
    fn normalize_identifier(&self, name: &str) -> String;
}

impl<F> NamingConvention for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn normalize_identifier(&self, name: &str) -> String {
        self(name)
    }
}

/// Lowercase snake_case identifiers, the shape warehouse column names take.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnakeCaseNaming;

impl NamingConvention for SnakeCaseNaming {
    fn normalize_identifier(&self, name: &str) -> String {
        let ident = name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect::<String>()
            .split('_')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        match ident.chars().next() {
            None => "_".to_string(),
            Some(first) if first.is_ascii_digit() => format!("_{ident}"),
            Some(_) => ident,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_collapses_punctuation_and_whitespace() {
        let naming = SnakeCaseNaming;
        assert_eq!(naming.normalize_identifier("  Lead Source (web) "), "lead_source_web");
        assert_eq!(naming.normalize_identifier("Deal--Value"), "deal_value");
        assert_eq!(naming.normalize_identifier("2nd contact"), "_2nd_contact");
        assert_eq!(naming.normalize_identifier("!!!"), "_");
    }

    #[test]
    fn closures_act_as_naming_conventions() {
        let upper = |name: &str| name.to_uppercase();
        assert_eq!(upper.normalize_identifier("tags"), "TAGS");
    }
}
