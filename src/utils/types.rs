use std::collections::HashMap;

bitflags::bitflags! {
    /// Permission column of a memory map header line.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const SHARED = 1 << 3;
        const PRIVATE = 1 << 4;
    }
}

impl Perms {
    pub fn from_column(column: &str) -> Self {
        let mut perms = Perms::empty();
        for c in column.chars() {
            perms |= match c {
                'r' => Perms::READ,
                'w' => Perms::WRITE,
                'x' => Perms::EXECUTE,
                's' => Perms::SHARED,
                'p' => Perms::PRIVATE,
                _ => Perms::empty(),
            };
        }
        perms
    }
}

/// One entry of `/proc/<pid>/smaps`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub device: String,
    pub inode: u64,
    pub pathname: String,
    /// Lowercased `key: value` rows that follow the header line.
    pub attributes: HashMap<String, String>,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn has_vm_flag(&self, flag: &str) -> bool {
        let flag = flag.to_ascii_lowercase();
        self.attributes
            .get("vmflags")
            .is_some_and(|flags| flags.split_whitespace().any(|f| f == flag))
    }

    /// Backed by a named file rather than anonymous or `[special]` memory.
    pub fn is_file_backed(&self) -> bool {
        !self.pathname.is_empty() && !self.pathname.starts_with('[')
    }

    /// Whether the region's bytes go into the image.
    ///
    /// Unreadable, `dd` (dontdump) and `io` regions are skipped, and so is
    /// anything whose start is negative as a signed address: that is kernel
    /// space (`[vsyscall]`) and must not be read through the mem handle.
    pub fn is_dumpable(&self) -> bool {
        self.perms.contains(Perms::READ)
            && !self.has_vm_flag("dd")
            && !self.has_vm_flag("io")
            && (self.start as i64) >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, perms: &str, vmflags: &str) -> MemoryRegion {
        MemoryRegion {
            start,
            end: start.wrapping_add(0x1000),
            perms: Perms::from_column(perms),
            attributes: HashMap::from([("vmflags".to_owned(), vmflags.to_owned())]),
            ..Default::default()
        }
    }

    #[test]
    fn perms_column() {
        assert_eq!(Perms::from_column("r--p"), Perms::READ | Perms::PRIVATE);
        assert_eq!(
            Perms::from_column("rwxs"),
            Perms::READ | Perms::WRITE | Perms::EXECUTE | Perms::SHARED
        );
        assert_eq!(Perms::from_column("---p"), Perms::PRIVATE);
    }

    #[test]
    fn vm_flags_match_whole_words() {
        let r = region(0x1000, "r--p", "rd mr mw me dw sd");
        assert!(r.has_vm_flag("rd"));
        assert!(r.has_vm_flag("SD"));
        assert!(!r.has_vm_flag("d"));
        assert!(!r.has_vm_flag("dd"));
    }

    #[test]
    fn dumpable_policy() {
        assert!(region(0x1000, "r--p", "rd mr").is_dumpable());
        assert!(!region(0x1000, "---p", "mr").is_dumpable());
        assert!(!region(0x1000, "r--p", "rd dd").is_dumpable());
        assert!(!region(0x1000, "r--p", "rd io pf").is_dumpable());
        assert!(!region(0xffff_ffff_ff60_0000, "r-xp", "rd ex").is_dumpable());
    }

    #[test]
    fn file_backed() {
        let mut r = region(0x1000, "r--p", "");
        assert!(!r.is_file_backed());
        r.pathname = "[heap]".into();
        assert!(!r.is_file_backed());
        r.pathname = "/usr/bin/cat".into();
        assert!(r.is_file_backed());
    }
}
