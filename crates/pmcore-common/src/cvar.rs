// cvar.rs -- named configuration variables

use std::collections::HashMap;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CvarFlags: u32 {
        const ARCHIVE = 1 << 0; // written by write_variables
        const NOSET   = 1 << 1; // only force_set may change it
        const LATCH   = 1 << 2; // held until get_latched_vars while a server runs
    }
}

/// A configuration variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

/// Errors from [`CvarContext::exec_config`].
#[derive(Debug, Clone, PartialEq)]
pub enum CvarError {
    /// A line that is neither a comment nor `set <name> <value>`.
    Syntax { line: usize, text: String },
}

impl std::fmt::Display for CvarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarError::Syntax { line, text } => write!(f, "line {}: cannot parse \"{}\"", line, text),
        }
    }
}

impl std::error::Error for CvarError {}

fn parse_value(s: &str) -> f32 {
    s.parse::<f32>().unwrap_or(0.0)
}

/// The full cvar table.
#[derive(Debug, Clone, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) cvar lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Get the floating-point value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    /// Get the string value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create a cvar. If it already exists, the value is not changed
    /// but flags are OR'd in. Returns None only when the cvar does not exist
    /// and no value was given.
    pub fn get(&mut self, name: &str, value: Option<&str>, flags: CvarFlags) -> Option<usize> {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return Some(idx);
        }

        let value = value?;
        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);

        Some(idx)
    }

    fn set2(&mut self, name: &str, value: &str, force: bool, server_active: bool) -> Option<usize> {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, Some(value), CvarFlags::empty()),
        };
        let var = &mut self.cvar_vars[idx];

        if !force {
            if var.flags.contains(CvarFlags::NOSET) {
                log::warn!("{} is write protected.", name);
                return Some(idx);
            }

            if var.flags.contains(CvarFlags::LATCH) {
                match var.latched_string {
                    Some(ref latched) if value == latched => return Some(idx),
                    None if value == var.string => return Some(idx),
                    _ => {}
                }

                if server_active {
                    log::info!("{} will be changed for next game.", name);
                    var.latched_string = Some(value.to_string());
                    return Some(idx);
                }
                var.latched_string = None;
            }
        } else {
            var.latched_string = None;
        }

        if value == var.string {
            return Some(idx); // not changed
        }

        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);

        Some(idx)
    }

    /// Set a cvar value (respects NOSET).
    pub fn set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, false, false)
    }

    /// Set a cvar while a simulation is running; LATCH cvars are deferred.
    pub fn set_with_server_state(&mut self, name: &str, value: &str, server_active: bool) -> Option<usize> {
        self.set2(name, value, false, server_active)
    }

    /// Force-set a cvar value (ignores NOSET and LATCH).
    pub fn force_set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, true, false)
    }

    /// Set a cvar from a float value.
    pub fn set_value(&mut self, name: &str, value: f32) {
        let val_str = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &val_str);
    }

    /// Apply all latched variable changes.
    pub fn get_latched_vars(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.value = parse_value(&latched);
                var.string = latched;
                var.modified = true;
            }
        }
    }

    /// Clear the modified flag on every cvar whose name starts with
    /// `prefix` and report whether any were set.
    pub fn take_modified(&mut self, prefix: &str) -> bool {
        let mut any = false;
        for var in self.cvar_vars.iter_mut().filter(|v| v.name.starts_with(prefix)) {
            any |= var.modified;
            var.modified = false;
        }
        any
    }

    /// Write all archived cvars to a writer.
    pub fn write_variables(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        for var in &self.cvar_vars {
            if var.flags.contains(CvarFlags::ARCHIVE) {
                writeln!(writer, "set {} \"{}\"", var.name, var.string)?;
            }
        }
        Ok(())
    }

    /// Run a config script of `set <name> <value>` lines. Blank lines and
    /// `//` comments are skipped. Returns the number of variables set.
    pub fn exec_config(&mut self, text: &str) -> Result<usize, CvarError> {
        let mut count = 0;
        for (n, raw) in text.lines().enumerate() {
            let line = match raw.find("//") {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let syntax = || CvarError::Syntax { line: n + 1, text: raw.to_string() };
            let rest = line.strip_prefix("set ").ok_or_else(syntax)?.trim_start();
            let (name, value) = rest.split_once(char::is_whitespace).ok_or_else(syntax)?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);

            self.set(name, value);
            count += 1;
        }
        Ok(count)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", Some("42"), CvarFlags::empty());
        assert_eq!(ctx.variable_value("test_var"), 42.0);
        assert_eq!(ctx.variable_string("test_var"), "42");
    }

    #[test]
    fn test_cvar_get_creates_once() {
        let mut ctx = CvarContext::new();
        ctx.get("test", Some("1"), CvarFlags::empty());
        ctx.get("test", Some("2"), CvarFlags::ARCHIVE); // should NOT change value
        assert_eq!(ctx.variable_string("test"), "1");
        assert!(ctx.find_var("test").unwrap().flags.contains(CvarFlags::ARCHIVE));
        assert_eq!(ctx.get("missing", None, CvarFlags::empty()), None);
    }

    #[test]
    fn test_cvar_noset() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", Some("10"), CvarFlags::NOSET);
        ctx.set("test_var", "20"); // should be blocked
        assert_eq!(ctx.variable_value("test_var"), 10.0);
        ctx.force_set("test_var", "20");
        assert_eq!(ctx.variable_value("test_var"), 20.0);
    }

    #[test]
    fn test_cvar_set_value() {
        let mut ctx = CvarContext::new();
        ctx.set_value("pm_friction", 4.0);
        assert_eq!(ctx.variable_string("pm_friction"), "4");
        ctx.set_value("pm_friction", 2.5);
        assert_eq!(ctx.variable_string("pm_friction"), "2.5");
    }

    #[test]
    fn test_cvar_latch() {
        let mut ctx = CvarContext::new();
        ctx.get("pm_step_size", Some("18"), CvarFlags::LATCH);
        ctx.set_with_server_state("pm_step_size", "24", true);
        assert_eq!(ctx.variable_value("pm_step_size"), 18.0, "not changed yet");
        assert_eq!(ctx.cvar_vars[0].latched_string.as_deref(), Some("24"));
        ctx.get_latched_vars();
        assert_eq!(ctx.variable_value("pm_step_size"), 24.0);
    }

    #[test]
    fn test_take_modified_by_prefix() {
        let mut ctx = CvarContext::new();
        ctx.get("pm_max_speed", Some("300"), CvarFlags::empty());
        ctx.get("other", Some("1"), CvarFlags::empty());
        assert!(ctx.take_modified("pm_"));
        assert!(!ctx.take_modified("pm_"), "flag is cleared");
        ctx.set("pm_max_speed", "320");
        ctx.set("pm_max_speed", "320");
        assert!(ctx.take_modified("pm_"));
        assert!(ctx.take_modified("other"));
    }

    #[test]
    fn test_write_variables() {
        let mut ctx = CvarContext::new();
        ctx.get("archived_var", Some("hello"), CvarFlags::ARCHIVE);
        ctx.get("normal_var", Some("world"), CvarFlags::empty());
        let mut buf = Vec::new();
        ctx.write_variables(&mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("set archived_var \"hello\""));
        assert!(!output.contains("normal_var"));
    }

    #[test]
    fn test_exec_config() {
        let mut ctx = CvarContext::new();
        let script = "// movement\nset pm_gravity 600\n\nset pm_name \"quoted value\" // trailing\n";
        assert_eq!(ctx.exec_config(script), Ok(2));
        assert_eq!(ctx.variable_value("pm_gravity"), 600.0);
        assert_eq!(ctx.variable_string("pm_name"), "quoted value");
    }

    #[test]
    fn test_exec_config_reports_bad_line() {
        let mut ctx = CvarContext::new();
        let err = ctx.exec_config("set a 1\nbind x jump\n").unwrap_err();
        assert_eq!(err, CvarError::Syntax { line: 2, text: "bind x jump".to_string() });
        assert_eq!(ctx.variable_value("a"), 1.0, "earlier lines still applied");
    }
}
