//! View resolution: custom pages when the host supplies them, built-in
//! fallbacks otherwise.

use std::path::PathBuf;

use askama::Template;
use async_trait::async_trait;

/// An error while resolving or rendering a custom view.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// The views directory could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Template rendering failed.
    #[error(transparent)]
    Template(#[from] askama::Error),
}

/// The logical pages this middleware renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// The login page.
    Login,
    /// The signup page.
    Signup,
}

impl ViewKind {
    /// The logical name a custom view is looked up by.
    pub fn name(self) -> &'static str {
        match self {
            ViewKind::Login => "login",
            ViewKind::Signup => "signup",
        }
    }
}

/// Data a view may interpolate.
///
/// Error messages arrive raw and unescaped; whichever layer renders them
/// is responsible for escaping each exactly once.
#[derive(Debug, Clone, Default)]
pub struct ViewContext {
    /// Ordered signup error messages; empty everywhere else.
    pub errors: Vec<String>,
}

/// Resolves custom views by logical name.
///
/// `Ok(None)` means "no custom view registered" and is not an error: the
/// caller falls back to the built-in page. Only genuine resolution or
/// rendering faults are `Err`.
#[async_trait]
pub trait Views: Clone + Send + Sync + 'static {
    /// Render the custom view for `view`, if one exists.
    async fn render(&self, view: ViewKind, cx: &ViewContext)
        -> Result<Option<String>, ViewError>;
}

/// The no-customization resolver: every page falls back to the built-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinViews;

#[async_trait]
impl Views for BuiltinViews {
    async fn render(
        &self,
        _view: ViewKind,
        _cx: &ViewContext,
    ) -> Result<Option<String>, ViewError> {
        Ok(None)
    }
}

/// Resolves custom views from a directory of template files.
///
/// A file matches when its stem equals the logical view name, regardless
/// of extension. When several extensions are present the lexicographically
/// first file name wins, so resolution never depends on directory-listing
/// order. The resolved file is served as HTML after substituting the
/// literal `{{errors}}` marker with the escaped error list; files without
/// the marker are served as-is.
#[derive(Debug, Clone)]
pub struct DirectoryViews {
    dir: PathBuf,
}

/// The marker a custom view places where error messages should appear.
pub const ERRORS_MARKER: &str = "{{errors}}";

#[derive(Template)]
#[template(
    source = "{% for error in errors %}<p class=\"error\">{{ error }}</p>\n{% endfor %}",
    ext = "html"
)]
struct ErrorList<'a> {
    errors: &'a [String],
}

impl DirectoryViews {
    /// Creates a resolver over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn resolve(&self, name: &str) -> Result<Option<PathBuf>, ViewError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            // A missing views directory just means "nothing customized".
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file()
                && path.file_stem().is_some_and(|stem| stem == name)
            {
                candidates.push(path);
            }
        }

        candidates.sort();
        Ok(candidates.into_iter().next())
    }
}

impl Default for DirectoryViews {
    fn default() -> Self {
        Self::new("./views")
    }
}

#[async_trait]
impl Views for DirectoryViews {
    async fn render(
        &self,
        view: ViewKind,
        cx: &ViewContext,
    ) -> Result<Option<String>, ViewError> {
        let Some(path) = self.resolve(view.name()).await? else {
            return Ok(None);
        };

        let template = tokio::fs::read_to_string(&path).await?;
        let errors = ErrorList { errors: &cx.errors }.render()?;
        Ok(Some(template.replace(ERRORS_MARKER, &errors)))
    }
}

/// The built-in login page, offering both the local and the OpenID form.
#[derive(Template)]
#[template(path = "login.html")]
pub(crate) struct LoginPage;

/// The built-in signup page.
#[derive(Template)]
#[template(path = "signup.html")]
pub(crate) struct SignupPage<'a> {
    pub(crate) errors: &'a [String],
}
