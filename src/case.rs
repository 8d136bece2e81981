//! Identifier conventions for tables and columns derived from entity and edge names.

/// Convert a single identifier from CamelCase to snake_case.
/// e.g. "GroupInfo" -> "group_info", "userId" -> "user_id"
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Naive English plural for table names: "user" -> "users", "city" -> "cities", "box" -> "boxes".
pub fn pluralize(s: &str) -> String {
    let consonant_y = s.ends_with('y') && !s.ends_with("ay") && !s.ends_with("ey") && !s.ends_with("oy") && !s.ends_with("uy");
    if consonant_y {
        format!("{}ies", &s[..s.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|suf| s.ends_with(suf)) {
        format!("{}es", s)
    } else {
        format!("{}s", s)
    }
}

/// Default table for an entity: "GroupInfo" -> "group_infos".
pub fn table_name(entity: &str) -> String {
    pluralize(&to_snake_case(entity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_conversion() {
        assert_eq!(to_snake_case("GroupInfo"), "group_info");
        assert_eq!(to_snake_case("user_id"), "user_id");
        assert_eq!(to_snake_case("Tenant"), "tenant");
    }

    #[test]
    fn table_names() {
        assert_eq!(table_name("User"), "users");
        assert_eq!(table_name("Company"), "companies");
        assert_eq!(table_name("Box"), "boxes");
        assert_eq!(table_name("Day"), "days");
    }
}
