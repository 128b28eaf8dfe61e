use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::SearchSettings;
use crate::types::{QueryFlags, SortKey};

/// A named search preset. Equality is by name only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub match_case: bool,
    #[serde(default)]
    pub match_whole_word: bool,
    #[serde(default)]
    pub match_path: bool,
    #[serde(default)]
    pub use_regex: bool,
    #[serde(default)]
    pub search_prefix: String,
    #[serde(default, rename = "macro")]
    pub macro_name: String,
}

impl FilterSpec {
    pub fn new(name: &str, search_prefix: &str, macro_name: &str) -> Self {
        Self {
            name: name.to_string(),
            match_case: false,
            match_whole_word: false,
            match_path: false,
            use_regex: false,
            search_prefix: search_prefix.to_string(),
            macro_name: macro_name.to_string(),
        }
    }

    /// Request flags: a flag is on when either the global setting or this
    /// filter turns it on.
    pub fn flags(&self, settings: &SearchSettings) -> QueryFlags {
        QueryFlags {
            match_case: settings.match_case || self.match_case,
            match_path: settings.match_path || self.match_path,
            match_whole_word: settings.match_whole_word || self.match_whole_word,
            use_regex: settings.use_regex || self.use_regex,
            sort: SortKey::from_code(settings.sort),
        }
    }

    /// Whether this definition only repeats one of the built-in default filters.
    fn shadows_default(&self) -> bool {
        matches!(self.search_prefix.trim(), "" | "file:" | "folder:")
    }
}

impl PartialEq for FilterSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FilterSpec {}

impl Hash for FilterSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

pub static DEFAULT_FILTERS: Lazy<Vec<FilterSpec>> = Lazy::new(|| {
    vec![
        FilterSpec::new("All", "", ""),
        FilterSpec::new("Files", "file:", ""),
        FilterSpec::new("Folders", "folder:", ""),
    ]
});

pub static DEFAULT_USER_FILTERS: Lazy<Vec<FilterSpec>> = Lazy::new(|| {
    vec![
        FilterSpec::new(
            "Audio",
            "ext:aac;ac3;aif;aifc;aiff;au;cda;dts;fla;flac;it;m1a;m2a;m3u;m4a;mid;midi;mka;mod;mp2;mp3;mpa;ogg;ra;rmi;spc;snd;umx;voc;wav;wma;xm",
            "audio",
        ),
        FilterSpec::new(
            "Compressed",
            "ext:7z;ace;arj;bz2;cab;gz;gzip;jar;r00;r01;r02;r03;r04;r05;r06;r07;r08;r09;r10;r11;r12;r13;r14;r15;r16;r17;r18;r19;r20;r21;r22;r23;r24;r25;r26;r27;r28;r29;rar;tar;tgz;z;zip",
            "zip",
        ),
        FilterSpec::new(
            "Document",
            "ext:c;chm;cpp;csv;cxx;doc;docm;docx;dot;dotm;dotx;h;hpp;htm;html;hxx;ini;java;lua;mht;mhtml;odt;pdf;potx;potm;ppam;ppsm;ppsx;pps;ppt;pptm;pptx;rtf;sldm;sldx;thmx;txt;vsd;wpd;wps;wri;xlam;xls;xlsb;xlsm;xlsx;xltm;xltx;xml",
            "doc",
        ),
        FilterSpec::new("Executable", "ext:bat;cmd;exe;msi;msp;scr", "exe"),
        FilterSpec::new(
            "Picture",
            "ext:ani;bmp;gif;ico;jpe;jpeg;jpg;pcx;png;psd;tga;tif;tiff;webp;wmf",
            "pic",
        ),
        FilterSpec::new(
            "Video",
            "ext:3g2;3gp;3gp2;3gpp;amr;amv;asf;avi;bdmv;bik;d2v;divx;drc;dsa;dsm;dss;dsv;evo;f4v;flc;fli;flic;flv;hdmov;ifo;ivf;m1v;m2p;m2t;m2ts;m2v;m4b;m4p;m4v;mkv;mp2v;mp4;mp4v;mpe;mpeg;mpg;mpls;mpv2;mpv4;mov;mts;ogm;ogv;pss;pva;qt;ram;ratdvd;rm;rmm;rmvb;roq;rpm;smil;smk;swf;tp;tpr;ts;vob;vp6;webm;wm;wmp;wmv",
            "video",
        ),
    ]
});

/// The two ordered filter lists the ring is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCatalog {
    defaults: Vec<FilterSpec>,
    users: Vec<FilterSpec>,
}

impl FilterCatalog {
    /// Builds the catalog for the given settings. `imported` replaces the
    /// built-in user filters when filter import is enabled. Regex mode keeps
    /// only the first default filter and no user filters.
    pub fn new(settings: &SearchSettings, imported: Option<Vec<FilterSpec>>) -> Self {
        if settings.use_regex {
            return Self {
                defaults: DEFAULT_FILTERS.iter().take(1).cloned().collect(),
                users: Vec::new(),
            };
        }

        let users = match imported {
            Some(list) if settings.import_filters => list
                .into_iter()
                .filter(|f| !f.shadows_default())
                .collect(),
            _ => DEFAULT_USER_FILTERS.clone(),
        };

        Self {
            defaults: DEFAULT_FILTERS.clone(),
            users,
        }
    }

    pub fn defaults(&self) -> &[FilterSpec] {
        &self.defaults
    }

    pub fn users(&self) -> &[FilterSpec] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.defaults.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_default(&self) -> FilterSpec {
        self.defaults
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_FILTERS[0].clone())
    }

    /// Logical ring index of `filter`: defaults first, then user filters.
    pub fn position(&self, filter: &FilterSpec) -> Option<usize> {
        if let Some(i) = self.defaults.iter().position(|f| f == filter) {
            return Some(i);
        }
        self.users
            .iter()
            .position(|f| f == filter)
            .map(|i| self.defaults.len() + i)
    }

    pub fn get(&self, index: usize) -> Option<&FilterSpec> {
        if index < self.defaults.len() {
            self.defaults.get(index)
        } else {
            self.users.get(index - self.defaults.len())
        }
    }

    pub fn find(&self, name: &str) -> Option<&FilterSpec> {
        self.defaults
            .iter()
            .chain(self.users.iter())
            .find(|f| f.name.eq_ignore_ascii_case(name) || f.macro_name.eq_ignore_ascii_case(name))
    }
}
