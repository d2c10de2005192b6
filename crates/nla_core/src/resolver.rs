//! Mapping between logical archive paths, spot names and physical storage paths.
//!
//! Built from two line-delimited tables served by the archive app:
//! `download_conf` (`spot_name logical_path` per line) and `spotlist`
//! (`storage_path spot_name` per line). A [`PathResolver`] is an immutable
//! value; reloading means building a new one and swapping it in.

use std::collections::HashMap;

use crate::error::{NlaResult, ResolverErrorKind};

/// Resolves logical paths to spots and spots to storage paths.
#[derive(Clone, Debug, Default)]
pub struct PathResolver {
    /// fileset logical prefixes, sorted descending so longest prefixes match first
    prefixes: Vec<String>,
    spot_by_prefix: HashMap<String, String>,
    prefix_by_spot: HashMap<String, String>,
    storage_by_spot: HashMap<String, String>,
}

impl PathResolver {
    /// Build a resolver from the raw table contents.
    pub fn from_tables(download_conf: &str, spotlist: &str) -> NlaResult<Self> {
        let mut prefixes = Vec::new();
        let mut spot_by_prefix = HashMap::new();
        let mut prefix_by_spot = HashMap::new();
        for line in download_conf.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(spot_name), Some(logical_path)) = (fields.next(), fields.next()) else {
                return Err(ResolverErrorKind::MalformedLine(line.to_string()).into());
            };
            prefixes.push(logical_path.to_string());
            _ = spot_by_prefix.insert(logical_path.to_string(), spot_name.to_string());
            _ = prefix_by_spot.insert(spot_name.to_string(), logical_path.to_string());
        }
        // reverse sort so that longer paths match first
        prefixes.sort_unstable_by(|a, b| b.cmp(a));

        let mut storage_by_spot = HashMap::new();
        for line in spotlist.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(storage_path), Some(spot_name)) = (fields.next(), fields.next()) else {
                return Err(ResolverErrorKind::MalformedLine(line.to_string()).into());
            };
            _ = storage_by_spot.insert(spot_name.to_string(), storage_path.to_string());
        }

        Ok(Self {
            prefixes,
            spot_by_prefix,
            prefix_by_spot,
            storage_by_spot,
        })
    }

    /// Fetch both tables and build a resolver.
    pub fn load(download_conf_url: &str, spotlist_url: &str) -> NlaResult<Self> {
        let download_conf = fetch_table(download_conf_url)?;
        let spotlist = fetch_table(spotlist_url)?;
        Self::from_tables(&download_conf, &spotlist)
    }

    /// Return the fileset prefix and spot name for a logical path.
    ///
    /// e.g. `/badc/cira/data/x.dat -> ("/badc/cira", "spot-1234-cira")`
    pub fn resolve_spot<'a>(&'a self, logical_path: &str) -> NlaResult<(&'a str, &'a str)> {
        for prefix in &self.prefixes {
            if logical_path.starts_with(prefix.as_str()) {
                let spot = &self.spot_by_prefix[prefix];
                return Ok((prefix, spot));
            }
        }
        Err(ResolverErrorKind::NoFilesetForPath(logical_path.to_string()).into())
    }

    /// The logical root of a spot (inverse of [`Self::resolve_spot`]).
    pub fn logical_root(&self, spot_name: &str) -> Option<&str> {
        self.prefix_by_spot.get(spot_name).map(String::as_str)
    }

    /// The physical storage path backing a spot.
    pub fn storage_path(&self, spot_name: &str) -> NlaResult<&str> {
        self.storage_by_spot
            .get(spot_name)
            .map(String::as_str)
            .ok_or_else(|| ResolverErrorKind::UnknownSpot(spot_name.to_string()).into())
    }

    /// The archive volume holding a logical path, e.g. `/datacentre/archvol/pan52/archive`.
    pub fn archive_volume(&self, logical_path: &str) -> NlaResult<String> {
        let (_, spot_name) = self.resolve_spot(logical_path)?;
        let storage = self.storage_path(spot_name)?;
        let volume = storage.rsplit_once('/').map_or("", |(head, _)| head);
        Ok(volume.to_string())
    }

    /// The path a file is addressed by on the tape side.
    ///
    /// In test mode the tape system mirrors the archive namespace, so the
    /// logical path is used verbatim; in production the fileset prefix is
    /// replaced by `/archive/<spot_name>`.
    pub fn tape_side_path(&self, logical_path: &str, test_mode: bool) -> NlaResult<String> {
        if test_mode {
            return Ok(logical_path.to_string());
        }
        let (prefix, spot_name) = self.resolve_spot(logical_path)?;
        Ok(format!("/archive/{spot_name}{}", &logical_path[prefix.len()..]))
    }

    /// All known spot names.
    pub fn spot_names(&self) -> impl Iterator<Item = &str> {
        self.storage_by_spot.keys().map(String::as_str)
    }
}

fn fetch_table(url: &str) -> NlaResult<String> {
    let response = reqwest::blocking::get(url).map_err(ResolverErrorKind::FromReqwestError)?;
    if !response.status().is_success() {
        return Err(ResolverErrorKind::FetchFailed {
            url: url.to_string(),
            status: response.status().as_u16(),
        }
        .into());
    }
    response.text().map_err(|err| ResolverErrorKind::FromReqwestError(err).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOWNLOAD_CONF: &str = "\
spot-0001-cira /badc/cira
spot-0002-cira-data /badc/cira/data
spot-0003-faam /badc/faam
";
    const SPOTLIST: &str = "\
/datacentre/archvol/pan52/archive/cira spot-0001-cira
/datacentre/archvol/pan52/archive/cira-data spot-0002-cira-data
/datacentre/archvol/pan23/archive/faam spot-0003-faam
";

    fn resolver() -> PathResolver {
        PathResolver::from_tables(DOWNLOAD_CONF, SPOTLIST).unwrap()
    }

    #[test]
    fn longest_prefix_matches_first() {
        let resolver = resolver();
        let (prefix, spot) = resolver.resolve_spot("/badc/cira/data/x.dat").unwrap();
        assert_eq!((prefix, spot), ("/badc/cira/data", "spot-0002-cira-data"));
        let (prefix, spot) = resolver.resolve_spot("/badc/cira/other/x.dat").unwrap();
        assert_eq!((prefix, spot), ("/badc/cira", "spot-0001-cira"));
    }

    #[test]
    fn unmapped_path_is_an_error() {
        let resolver = resolver();
        assert!(resolver.resolve_spot("/neodc/unknown/x.dat").is_err());
    }

    #[test]
    fn storage_and_volume_lookup() {
        let resolver = resolver();
        assert_eq!(
            resolver.storage_path("spot-0003-faam").unwrap(),
            "/datacentre/archvol/pan23/archive/faam"
        );
        assert_eq!(
            resolver.archive_volume("/badc/faam/data/y.dat").unwrap(),
            "/datacentre/archvol/pan23/archive"
        );
    }

    #[test]
    fn tape_side_path_replaces_the_fileset_prefix() {
        let resolver = resolver();
        assert_eq!(
            resolver.tape_side_path("/badc/faam/data/y.dat", false).unwrap(),
            "/archive/spot-0003-faam/data/y.dat"
        );
        assert_eq!(
            resolver.tape_side_path("/badc/faam/data/y.dat", true).unwrap(),
            "/badc/faam/data/y.dat"
        );
    }

    #[test]
    fn logical_root_is_the_inverse_mapping() {
        let resolver = resolver();
        assert_eq!(resolver.logical_root("spot-0001-cira"), Some("/badc/cira"));
        assert_eq!(resolver.logical_root("spot-none"), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(PathResolver::from_tables("only-one-field\n", "").is_err());
    }
}
