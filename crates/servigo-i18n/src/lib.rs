//! Locale state, persisted language preference, and UI-string lookup.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "servigo-i18n";

/// The fixed language set. Invalid tags are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    Ar,
    Fr,
    En,
}

impl Language {
    pub const DEFAULT: Language = Language::Fr;

    pub const fn all() -> [Language; 3] {
        [Language::Ar, Language::Fr, Language::En]
    }

    pub fn tag(self) -> &'static str {
        match self {
            Language::Ar => "ar",
            Language::Fr => "fr",
            Language::En => "en",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ar" => Some(Language::Ar),
            "fr" => Some(Language::Fr),
            "en" => Some(Language::En),
            _ => None,
        }
    }

    /// Native-script name shown in the language switcher.
    pub fn display_name(self) -> &'static str {
        match self {
            Language::Ar => "العربية",
            Language::Fr => "Français",
            Language::En => "English",
        }
    }

    pub fn direction(self) -> TextDirection {
        match self {
            Language::Ar => TextDirection::Rtl,
            Language::Fr | Language::En => TextDirection::Ltr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDirection {
    Ltr,
    Rtl,
}

impl TextDirection {
    /// Value rendered into the document's `dir` attribute.
    pub fn attr(self) -> &'static str {
        match self {
            TextDirection::Ltr => "ltr",
            TextDirection::Rtl => "rtl",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PrefsFile {
    language: String,
}

/// Durable store for the selected language tag. Unreadable or unknown
/// contents fall back to the default language.
#[derive(Debug, Clone)]
pub struct LanguagePrefs {
    path: PathBuf,
}

impl LanguagePrefs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<Language> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let prefs: PrefsFile = serde_json::from_str(&raw).ok()?;
        Language::from_tag(&prefs.language)
    }

    pub fn save(&self, language: Language) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating preference directory {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(&PrefsFile {
            language: language.tag().to_string(),
        })?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, body)
            .with_context(|| format!("writing preference temp file {}", temp.display()))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("replacing preference file {}", self.path.display()))?;
        Ok(())
    }
}

/// Process-wide locale resolver. Created once at startup and shared by
/// reference; lives for the process lifetime.
pub struct Localizer {
    prefs: LanguagePrefs,
    current: RwLock<Language>,
}

impl Localizer {
    /// Restore the persisted tag, or start from the default.
    pub fn new(prefs: LanguagePrefs) -> Self {
        let initial = prefs.load().unwrap_or(Language::DEFAULT);
        Self {
            prefs,
            current: RwLock::new(initial),
        }
    }

    pub fn language(&self) -> Language {
        *self.current.read().expect("locale lock")
    }

    /// Switch the active language and persist the choice. A persist failure
    /// is logged and the in-memory switch stands.
    pub fn set_language(&self, language: Language) {
        *self.current.write().expect("locale lock") = language;
        if let Err(err) = self.prefs.save(language) {
            warn!("persisting language preference failed: {err:#}");
        }
    }

    pub fn is_right_to_left(&self) -> bool {
        self.language().direction() == TextDirection::Rtl
    }

    /// (`lang`, `dir`) attribute values for the document root.
    pub fn document_attrs(&self) -> (&'static str, &'static str) {
        let language = self.language();
        (language.tag(), language.direction().attr())
    }

    /// Look up a UI string for the active language; unknown keys come back
    /// verbatim.
    pub fn translate(&self, key: &str) -> String {
        let table = table_for(self.language());
        table
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
            .unwrap_or_else(|| key.to_string())
    }
}

fn table_for(language: Language) -> &'static [(&'static str, &'static str)] {
    match language {
        Language::Ar => AR,
        Language::Fr => FR,
        Language::En => EN,
    }
}

const AR: &[(&str, &str)] = &[
    ("home", "الرئيسية"),
    ("services", "الخدمات"),
    ("contact", "اتصل بنا"),
    ("search", "بحث"),
    ("filter", "فلتر"),
    ("all", "الكل"),
    ("loading", "جاري التحميل..."),
    ("error", "خطأ"),
    ("reset", "إعادة تعيين"),
    ("postService", "انشر خدمتك"),
    ("findServices", "ابحث عن الخدمات"),
    ("serviceType", "نوع الخدمة"),
    ("onSite", "في الموقع"),
    ("online", "عبر الإنترنت"),
    ("category", "الفئة"),
    ("location", "الموقع"),
    ("heroTitle", "اعثر على أفضل مقدمي الخدمات في تونس"),
    (
        "heroSubtitle",
        "اكتشف واحجز خدمات عالية الجودة من محترفين معتمدين في منطقتك",
    ),
    ("serviceCoverage", "تغطية الخدمة"),
    ("availableAcross", "متاح في جميع أنحاء"),
    ("tunisia", "تونس"),
    (
        "serviceCoverageDescription",
        "خدمات منزلية احترافية يتم تقديمها إلى كل محافظة. اختر موقعك للبدء مع خبراء محليين موثوقين.",
    ),
    ("dontSeeArea", "لا ترى منطقتك؟ نحن نتوسع بسرعة في جميع أنحاء تونس."),
    ("contactForAvailability", "اتصل بنا للاستعلام عن التوفر"),
    ("verifiedProfessionals", "محترفون معتمدون"),
    (
        "verifiedProfessionalsDesc",
        "جميع محترفينا معتمدون ومقيمون من قبل عملاء مثلك",
    ),
    ("fastBooking", "حجز سريع"),
    (
        "fastBookingDesc",
        "احجز محترفاً في دقائق واحصل على المساعدة عندما تحتاجها أكثر",
    ),
    ("transparentPricing", "أسعار شفافة"),
    (
        "transparentPricingDesc",
        "اعرف التكلفة مقدماً بدون رسوم مخفية أو مفاجآت",
    ),
    ("noServicesAvailable", "لا توجد خدمات متاحة حتى الآن"),
    ("servicesFound", "خدمة متاحة"),
    ("loadError", "تعذر تحميل الخدمات. حاول مرة أخرى لاحقاً."),
    ("viewDetails", "عرض التفاصيل"),
    ("bookNow", "احجز الآن"),
    ("reviews", "التقييمات"),
];

const FR: &[(&str, &str)] = &[
    ("home", "Accueil"),
    ("services", "Services"),
    ("contact", "Contact"),
    ("search", "Rechercher"),
    ("filter", "Filtres"),
    ("all", "Tous"),
    ("loading", "Chargement..."),
    ("error", "Erreur"),
    ("reset", "Réinitialiser"),
    ("postService", "Publier votre service"),
    ("findServices", "Trouver des services"),
    ("serviceType", "Type de service"),
    ("onSite", "Sur site"),
    ("online", "En ligne"),
    ("category", "Catégorie"),
    ("location", "Lieu"),
    ("heroTitle", "Trouvez les meilleurs prestataires de services en Tunisie"),
    (
        "heroSubtitle",
        "Découvrez et réservez des services de qualité auprès de professionnels certifiés dans votre région",
    ),
    ("serviceCoverage", "Couverture de Service"),
    ("availableAcross", "Disponible à travers"),
    ("tunisia", "la Tunisie"),
    (
        "serviceCoverageDescription",
        "Services à domicile professionnels livrés dans chaque gouvernorat. Choisissez votre emplacement pour commencer avec des experts locaux de confiance.",
    ),
    (
        "dontSeeArea",
        "Vous ne voyez pas votre région ? Nous nous développons rapidement à travers la Tunisie.",
    ),
    ("contactForAvailability", "Contactez-nous pour la disponibilité"),
    ("verifiedProfessionals", "Professionnels Vérifiés"),
    (
        "verifiedProfessionalsDesc",
        "Tous nos professionnels sont vérifiés et évalués par des clients comme vous",
    ),
    ("fastBooking", "Réservation Rapide"),
    (
        "fastBookingDesc",
        "Réservez un professionnel en quelques minutes et obtenez de l'aide quand vous en avez le plus besoin",
    ),
    ("transparentPricing", "Tarification Transparente"),
    (
        "transparentPricingDesc",
        "Connaissez le coût à l'avance sans frais cachés ni surprises",
    ),
    ("noServicesAvailable", "Aucun service disponible pour le moment"),
    ("servicesFound", "services trouvés"),
    ("loadError", "Impossible de charger les services. Réessayez plus tard."),
    ("viewDetails", "Voir les détails"),
    ("bookNow", "Réserver maintenant"),
    ("reviews", "Avis"),
];

const EN: &[(&str, &str)] = &[
    ("home", "Home"),
    ("services", "Services"),
    ("contact", "Contact"),
    ("search", "Search"),
    ("filter", "Filters"),
    ("all", "All"),
    ("loading", "Loading..."),
    ("error", "Error"),
    ("reset", "Reset"),
    ("postService", "Post Your Service"),
    ("findServices", "Find Services"),
    ("serviceType", "Service Type"),
    ("onSite", "On-site"),
    ("online", "Online"),
    ("category", "Category"),
    ("location", "Location"),
    ("heroTitle", "Find the Best Service Providers in Tunisia"),
    (
        "heroSubtitle",
        "Discover and book quality services from certified professionals in your area",
    ),
    ("serviceCoverage", "Service Coverage"),
    ("availableAcross", "Available Across"),
    ("tunisia", "Tunisia"),
    (
        "serviceCoverageDescription",
        "Professional home services delivered to every governorate. Choose your location to get started with trusted local experts.",
    ),
    (
        "dontSeeArea",
        "Don't see your area? We're expanding rapidly across Tunisia.",
    ),
    ("contactForAvailability", "Contact us for availability"),
    ("verifiedProfessionals", "Verified Professionals"),
    (
        "verifiedProfessionalsDesc",
        "All our professionals are verified and rated by customers like you",
    ),
    ("fastBooking", "Fast Booking"),
    (
        "fastBookingDesc",
        "Book a professional within minutes and get help when you need it most",
    ),
    ("transparentPricing", "Transparent Pricing"),
    (
        "transparentPricingDesc",
        "Know the cost upfront with no hidden fees or surprises",
    ),
    ("noServicesAvailable", "No services available yet"),
    ("servicesFound", "services found"),
    ("loadError", "Could not load services. Please try again later."),
    ("viewDetails", "View Details"),
    ("bookNow", "Book Now"),
    ("reviews", "Reviews"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prefs_in(dir: &Path) -> LanguagePrefs {
        LanguagePrefs::new(dir.join("language.json"))
    }

    #[test]
    fn defaults_to_french_left_to_right() {
        let dir = tempdir().expect("tempdir");
        let localizer = Localizer::new(prefs_in(dir.path()));
        assert_eq!(localizer.language(), Language::Fr);
        assert!(!localizer.is_right_to_left());
        assert_eq!(localizer.document_attrs(), ("fr", "ltr"));
    }

    #[test]
    fn translate_returns_table_value_or_key_verbatim() {
        let dir = tempdir().expect("tempdir");
        let localizer = Localizer::new(prefs_in(dir.path()));
        assert_eq!(localizer.translate("services"), "Services");
        assert_eq!(localizer.translate("definitelyNotAKey"), "definitelyNotAKey");
    }

    #[test]
    fn every_language_covers_the_same_key_set() {
        let mut en_keys: Vec<_> = EN.iter().map(|(k, _)| *k).collect();
        let mut ar_keys: Vec<_> = AR.iter().map(|(k, _)| *k).collect();
        let mut fr_keys: Vec<_> = FR.iter().map(|(k, _)| *k).collect();
        en_keys.sort_unstable();
        ar_keys.sort_unstable();
        fr_keys.sort_unstable();
        assert_eq!(en_keys, ar_keys);
        assert_eq!(en_keys, fr_keys);
    }

    #[test]
    fn switching_to_arabic_flips_direction_and_table() {
        let dir = tempdir().expect("tempdir");
        let localizer = Localizer::new(prefs_in(dir.path()));
        localizer.set_language(Language::Ar);
        assert!(localizer.is_right_to_left());
        assert_eq!(localizer.document_attrs(), ("ar", "rtl"));
        assert_eq!(localizer.translate("services"), "الخدمات");
    }

    #[test]
    fn selected_language_survives_restart() {
        let dir = tempdir().expect("tempdir");
        {
            let localizer = Localizer::new(prefs_in(dir.path()));
            localizer.set_language(Language::Ar);
        }
        let restored = Localizer::new(prefs_in(dir.path()));
        assert_eq!(restored.language(), Language::Ar);
        assert!(restored.is_right_to_left());
    }

    #[test]
    fn corrupt_preference_file_falls_back_to_default() {
        let dir = tempdir().expect("tempdir");
        let prefs = prefs_in(dir.path());
        std::fs::write(prefs.path(), "not json").expect("write");
        let localizer = Localizer::new(prefs);
        assert_eq!(localizer.language(), Language::DEFAULT);
    }

    #[test]
    fn unknown_tag_is_not_constructible() {
        assert_eq!(Language::from_tag("de"), None);
        assert_eq!(Language::from_tag("AR"), None);
        assert_eq!(Language::from_tag("ar"), Some(Language::Ar));
    }
}
