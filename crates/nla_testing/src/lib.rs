use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use aho_corasick::{AhoCorasick, PatternID};
use tempfile::NamedTempFile;

pub type TestResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

pub fn get_matches<I, P>(patterns: I, output: String) -> TestResult<Vec<(PatternID, usize)>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let ac = AhoCorasick::new(patterns)?;
    let mut matches = vec![];
    for mat in ac.find_iter(output.as_str()) {
        add_match_to_vector(&mut matches, mat);
    }
    Ok(matches)
}

pub fn add_match_to_vector(matches: &mut Vec<(PatternID, usize)>, mat: aho_corasick::Match) {
    matches.push((mat.pattern(), mat.end() - mat.start()))
}

pub fn get_temp_file() -> TestResult<NamedTempFile> {
    Ok(NamedTempFile::new()?)
}

/// Write an executable shell script, for faking the external tape tools.
pub fn write_script(path: impl AsRef<Path>, body: &str) -> TestResult<PathBuf> {
    let path = path.as_ref();
    fs::write(path, body)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(path.to_path_buf())
}

/// A fake `sd_ls` that lists every file below `tape_dir` in the
/// eleven-column format the real tool produces.
pub fn fake_sd_ls(bin_dir: &Path, tape_dir: &Path) -> TestResult<PathBuf> {
    let body = format!(
        "#!/bin/sh\n\
         find {} -type f | while read f; do\n\
         sz=$(stat -c%s \"$f\")\n\
         echo \"1 spot TAPED $sz 0 badc badc 2016-02-09 10:00 vol $f\"\n\
         done\n",
        tape_dir.display()
    );
    write_script(bin_dir.join("sd_ls"), &body)
}

/// A fake `sd_get` that copies listed files out of `tape_dir` and writes
/// the test-mode progress log.
pub fn fake_sd_get(bin_dir: &Path, tape_dir: &Path) -> TestResult<PathBuf> {
    let body = format!(
        "#!/bin/sh\n\
         TAPE={}\n\
         while getopts vl:h:r:f: opt; do\n\
           case $opt in\n\
             l) LOG=$OPTARG;;\n\
             r) ROOT=$OPTARG;;\n\
             f) LISTING=$OPTARG;;\n\
           esac\n\
         done\n\
         while read SRC; do\n\
           DST=\"$ROOT$SRC\"\n\
           mkdir -p \"$(dirname \"$DST\")\"\n\
           cp \"$TAPE$SRC\" \"$DST\"\n\
           echo \"Copying file: $SRC to $DST\" >> \"$LOG\"\n\
         done < \"$LISTING\"\n",
        tape_dir.display()
    );
    write_script(bin_dir.join("sd_get"), &body)
}
